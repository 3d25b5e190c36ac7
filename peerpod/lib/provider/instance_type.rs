use tracing::info;

use crate::{PeerpodError, PeerpodResult};

use super::InstanceTypeSpec;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sorts instance types by GPUs, then memory, then vCPUs, all ascending.
pub fn sort_instance_types(specs: &mut [InstanceTypeSpec]) {
    specs.sort_by_key(|spec| (spec.gpus, spec.memory, spec.vcpus));
}

/// Returns the smallest GPU-less instance type with at least `vcpus` and `memory`.
///
/// `sorted` must be ordered with [`sort_instance_types`].
pub fn best_fit_instance_type(
    sorted: &[InstanceTypeSpec],
    vcpus: i64,
    memory: i64,
) -> PeerpodResult<String> {
    sorted
        .iter()
        .filter(|spec| spec.gpus == 0)
        .find(|spec| spec.memory >= memory && spec.vcpus >= vcpus)
        .map(|spec| spec.instance_type.clone())
        .ok_or_else(|| {
            PeerpodError::InvalidInput(format!(
                "no instance type found for {vcpus} vcpus and {memory} MiB of memory"
            ))
        })
}

/// Returns the smallest instance type with at least `gpus`, `vcpus` and `memory`.
pub fn best_fit_gpu_instance_type(
    sorted: &[InstanceTypeSpec],
    gpus: i64,
    vcpus: i64,
    memory: i64,
) -> PeerpodResult<String> {
    sorted
        .iter()
        .find(|spec| spec.gpus >= gpus && spec.vcpus >= vcpus && spec.memory >= memory)
        .map(|spec| spec.instance_type.clone())
        .ok_or_else(|| {
            PeerpodError::InvalidInput(format!(
                "no instance type found for {gpus} gpus, {vcpus} vcpus and {memory} MiB of memory"
            ))
        })
}

/// Picks the instance type for a pod VM.
///
/// An explicit type wins, then a GPU fit, then a vCPU and memory fit; without any of those the
/// default is used. The result must be the default or appear in `valid` when `valid` is
/// non-empty.
pub fn select_instance_type(
    spec: &InstanceTypeSpec,
    sorted: &[InstanceTypeSpec],
    valid: &[String],
    default: &str,
) -> PeerpodResult<String> {
    let selected = if !spec.instance_type.is_empty() {
        spec.instance_type.clone()
    } else if spec.gpus > 0 {
        best_fit_gpu_instance_type(sorted, spec.gpus, spec.vcpus, spec.memory)?
    } else if spec.vcpus != 0 && spec.memory != 0 {
        best_fit_instance_type(sorted, spec.vcpus, spec.memory)?
    } else {
        String::new()
    };

    if selected.is_empty() {
        info!(instance_type = default, "using the default instance type");
        return Ok(default.to_string());
    }

    if valid.is_empty() {
        if selected != default {
            return Err(PeerpodError::InvalidInput(format!(
                "requested instance type {selected:?} is not the default {default:?} and no other \
                 instance type is allowed"
            )));
        }
    } else if !valid.contains(&selected) {
        return Err(PeerpodError::InvalidInput(format!(
            "requested instance type {selected:?} is not one of the allowed instance types"
        )));
    }

    Ok(selected)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
