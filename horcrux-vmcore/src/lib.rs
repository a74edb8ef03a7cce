//! `horcrux-vmcore`: the per-node KVM/QEMU virtual-machine lifecycle core.
//!
//! This crate owns the hard engineering of running one VM on one node —
//! the block-device graph manager, the block-job engine, the snapshot
//! engine, and the VM state machine — and nothing else. The HTTP
//! surface, authentication, cluster membership, and the storage/network
//! drivers it depends on are external collaborators, reached only through
//! the named interfaces in [`storage`] and [`migration::RemoteNode`].
//!
//! Module-to-component mapping:
//!
//! | Component | Module |
//! |---|---|
//! | QMP client | [`qmp`] |
//! | Helpers / versions | [`version`] |
//! | Drive model & parser | [`drive`] |
//! | Storage interface | [`storage`] |
//! | Block-device graph | [`blockdev`] |
//! | Block-job engine | [`blockjob`] |
//! | Volume-chain manager | [`volumechain`] |
//! | Memory/CPU hotplug | [`hotplug`] |
//! | Config / lock | [`vmconfig`] |
//! | VM lifecycle | [`lifecycle`] |
//! | Snapshot engine | [`snapshot`] |
//! | Migration | [`migration`] |

pub mod blockdev;
pub mod blockjob;
pub mod drive;
pub mod error;
pub mod hotplug;
pub mod lifecycle;
pub mod lockfile;
pub mod logging;
pub mod migration;
pub mod qmp;
pub mod settings;
pub mod snapshot;
pub mod storage;
pub mod version;
pub mod vmconfig;
pub mod volumechain;

pub use error::{Error, Result};
