//! Installer-side contracts embedded in the ISO.
//!
//! The pipeline builds the medium; these types freeze what the installer
//! does on the target: the globalstorage key map, the pool creation argv,
//! the root-select wizard's state machine and the telemetry payload. The
//! Python module assets under `assets/calamares/modules/` implement these
//! contracts verbatim; the tests here are the compatibility suite.

pub mod globalstorage;
pub mod pool;
pub mod state;
pub mod telemetry;
