//! Static device partition across the worker × branch grid
//!
//! With `T = workers · branches` slots and `D` listed devices:
//!
//! ```text
//! D % T == 0   each slot owns D / T consecutive devices
//! T % D == 0   each device is shared by T / D consecutive slots
//! otherwise    rejected
//! ```
//!
//! Slots are numbered worker-major: slot `w · branches + b`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Devices available to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Devices {
    /// No devices; every branch gets an empty set
    #[default]
    None,
    /// Flat list partitioned across the grid
    List(Vec<String>),
    /// Explicit `[worker][branch] -> devices` assignment
    PerBranch(Vec<Vec<Vec<String>>>),
}

impl Devices {
    /// Flat list from anything displayable (`0`, `"cuda:1"`, ...).
    pub fn list<T: ToString>(devices: impl IntoIterator<Item = T>) -> Self {
        Self::List(devices.into_iter().map(|d| d.to_string()).collect())
    }
}

/// Device sets per worker and branch.
pub type Partition = Vec<Vec<Vec<String>>>;

/// Partition `devices` over `n_workers × n_branches` slots.
///
/// # Errors
/// Returns `InvalidConfig` when the device count and slot count do not
/// divide one another, or an explicit assignment has the wrong shape
pub fn partition(devices: &Devices, n_workers: usize, n_branches: usize) -> Result<Partition> {
    let n_workers = n_workers.max(1);
    let n_branches = n_branches.max(1);
    match devices {
        Devices::None => Ok(vec![vec![Vec::new(); n_branches]; n_workers]),
        Devices::List(list) if list.is_empty() => Ok(vec![vec![Vec::new(); n_branches]; n_workers]),
        Devices::List(list) => split(list, n_workers, n_branches),
        Devices::PerBranch(explicit) => {
            let shaped = explicit.len() == n_workers && explicit.iter().all(|w| w.len() == n_branches);
            if shaped {
                Ok(explicit.clone())
            } else {
                Err(Error::InvalidConfig(format!(
                    "device assignment must have shape {n_workers} workers x {n_branches} branches"
                )))
            }
        }
    }
}

fn split(list: &[String], n_workers: usize, n_branches: usize) -> Result<Partition> {
    let slots = n_workers * n_branches;
    let n_devices = list.len();
    let slot_devices: Vec<Vec<String>> = if n_devices % slots == 0 {
        list.chunks(n_devices / slots).map(<[String]>::to_vec).collect()
    } else if slots % n_devices == 0 {
        let share = slots / n_devices;
        (0..slots).map(|slot| vec![list[slot / share].clone()]).collect()
    } else {
        return Err(Error::InvalidConfig(format!(
            "{n_devices} devices cannot be split over {n_workers} workers x {n_branches} branches"
        )));
    };

    Ok(slot_devices
        .chunks(n_branches)
        .map(<[Vec<String>]>::to_vec)
        .collect())
}
