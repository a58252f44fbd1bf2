//! Build specification model: YAML sections, defaults and validation.

pub mod boot;
pub mod builder;
pub mod dracut;
pub mod hardening;
pub mod modules;
pub mod plan;
pub mod proxmox;
pub mod zfs;

pub use plan::BuildPlan;
