//! Runtime binding-profile selection.

use crate::config::{BindedCdevInfo, BindedCdevInfoMap, ThrottlingInfo};

/// External key-value source for per-sensor profile selection (conceptually
/// the `"<sensor>.profile"` runtime property).
pub trait ProfileSource: Send + Sync {
    /// Requested profile name for `sensor`; `None` or empty means default.
    fn profile_for(&self, sensor: &str) -> Option<String>;
}

/// No profiles: every sensor uses its default binding.
impl ProfileSource for () {
    fn profile_for(&self, _sensor: &str) -> Option<String> {
        None
    }
}

/// The binding set selected by `profile`, falling back to the default
/// binding when the profile is empty or unknown.
pub(crate) fn active_bindings<'a>(
    info: &'a ThrottlingInfo,
    profile: &str,
) -> &'a BindedCdevInfoMap {
    if !profile.is_empty() {
        if let Some(bindings) = info.profile_map.get(profile) {
            return bindings;
        }
    }
    &info.binded_cdev_info_map
}

/// Binding for one device under `profile`, falling back to the default
/// binding for devices the profile does not override.
pub(crate) fn binding_for<'a>(
    info: &'a ThrottlingInfo,
    profile: &str,
    cdev: &str,
) -> Option<&'a BindedCdevInfo> {
    if !profile.is_empty() {
        if let Some(binding) = info.profile_map.get(profile).and_then(|m| m.get(cdev)) {
            return Some(binding);
        }
    }
    info.binded_cdev_info_map.get(cdev)
}
