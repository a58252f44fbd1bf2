#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
// followings are from clippy::restriction
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::implicit_return)]
#![allow(clippy::blanket_clippy_restriction_lints)]
#![allow(clippy::pattern_type_mismatch)]

//! Build pipeline for Proxmox VE installer images on OpenZFS-on-root.
//!
//! The `cfg` module turns a YAML specification into a validated
//! [`cfg::BuildPlan`]; the [`pipeline`] runner walks the declared modules
//! over a [`workspace::Workspace`], checkpointing each stage; [`installer`]
//! freezes the contracts the produced ISO embeds.

pub mod cfg;
pub mod checkpoint;
pub mod chroot;
pub mod errors;
pub mod installer;
pub mod modules;
pub mod pipeline;
pub mod util;
pub mod workspace;
