//! Cross-platform disk type detection, used only to pick a sensible default
//! worker count for the ingest pipeline. No persistence: unlike the
//! teacher's network-latency probe, there is no `diskinfo` table in the
//! Barecat index to cache results into, so detection is cheap and re-run
//! on every open.

use std::path::Path;

use crate::config::WorkerTuning;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

pub mod network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveType {
    Ssd,
    Hdd,
    Network,
    Unknown,
}

impl DriveType {
    pub fn worker_threads(&self, available_threads: usize) -> usize {
        let limits = WorkerTuning::default();
        match self {
            DriveType::Ssd => available_threads,
            DriveType::Hdd => available_threads.min(limits.hdd_max),
            DriveType::Network => limits.floor,
            DriveType::Unknown => available_threads.min(limits.unknown_max),
        }
    }

    pub fn is_hdd(&self) -> bool {
        matches!(self, DriveType::Hdd)
    }

    pub fn is_network(&self) -> bool {
        matches!(self, DriveType::Network)
    }
}

pub fn drive_type_for_path(path: &Path) -> DriveType {
    #[cfg(target_os = "macos")]
    {
        macos::detect(path)
    }
    #[cfg(target_os = "linux")]
    {
        linux::detect(path)
    }
    #[cfg(target_os = "windows")]
    {
        windows::detect(path)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        log::debug!("unsupported platform for drive detection");
        DriveType::Unknown
    }
}

/// Pick a worker count for the ingest pipeline given the archive's root path.
pub fn determine_workers(path: &Path, available_threads: usize) -> (usize, DriveType) {
    let drive = drive_type_for_path(path);
    let tuning = WorkerTuning {
        all_threads: available_threads,
        ..WorkerTuning::default()
    };
    (tuning.workers_for(drive), drive)
}
