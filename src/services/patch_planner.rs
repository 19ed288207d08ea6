use crate::models::{GameUpdateResource, LocalGameVersion};

/// Outcome of planning an update path for one game.
#[derive(Clone, Debug)]
pub enum UpdatePlan {
    /// Nothing to download; the install already matches the newest resource.
    UpToDate,
    /// Resources to download and apply, in strict ascending order. Each
    /// incremental manifest is expressed against the immediately preceding
    /// version, so skipping an entry corrupts the install.
    Apply(Vec<GameUpdateResource>),
    /// No incremental path exists (legacy install, or a first install with no
    /// published full package). Distinct from `UpToDate`: the caller must
    /// offer a full reinstall instead of reporting "already current".
    NotUpdatable,
}

impl UpdatePlan {
    pub fn resources(&self) -> &[GameUpdateResource] {
        match self {
            UpdatePlan::Apply(resources) => resources,
            _ => &[],
        }
    }
}

/// Decides which resources must be applied to reach the newest version.
///
/// `local` is `None` for a game that was never installed through this
/// pipeline (fresh install: the newest full package is planned), `Legacy`
/// for an install discovered on disk with no recorded version (never
/// patchable), or a concrete version number.
pub fn plan(local: Option<LocalGameVersion>, resources: &[GameUpdateResource]) -> UpdatePlan {
    if resources.is_empty() {
        return UpdatePlan::UpToDate;
    }

    match local {
        Some(LocalGameVersion::Legacy) => UpdatePlan::NotUpdatable,
        Some(LocalGameVersion::Version(installed)) => {
            let mut pending: Vec<GameUpdateResource> = resources
                .iter()
                .filter(|resource| resource.internal_version > installed)
                .cloned()
                .collect();
            pending.sort_by_key(|resource| resource.internal_version);
            if pending.is_empty() {
                UpdatePlan::UpToDate
            } else {
                UpdatePlan::Apply(pending)
            }
        }
        None => resources
            .iter()
            .filter(|resource| resource.is_full_package)
            .max_by_key(|resource| resource.internal_version)
            .cloned()
            .map(|resource| UpdatePlan::Apply(vec![resource]))
            .unwrap_or(UpdatePlan::NotUpdatable),
    }
}

/// Guard the UI calls before offering the update button.
pub fn should_update_game(local: LocalGameVersion, resources: &[GameUpdateResource]) -> bool {
    match local {
        LocalGameVersion::Legacy => false,
        LocalGameVersion::Version(installed) => resources
            .iter()
            .any(|resource| resource.internal_version > installed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(version: u32, is_full_package: bool) -> GameUpdateResource {
        GameUpdateResource {
            internal_version: version,
            package_url: format!("https://cdn.example/pkg/{version}.zip"),
            metadata_url: format!("https://cdn.example/pkg/{version}.metadata.json"),
            patch_size_mb: 12.5,
            is_full_package,
        }
    }

    #[test]
    fn plans_every_newer_resource_in_ascending_order() {
        let resources = vec![
            resource(1, true),
            resource(2, false),
            resource(3, false),
            resource(4, false),
            resource(5, false),
        ];
        let plan = plan(Some(LocalGameVersion::Version(3)), &resources);
        let versions: Vec<u32> = plan
            .resources()
            .iter()
            .map(|r| r.internal_version)
            .collect();
        assert_eq!(versions, [4, 5]);
    }

    #[test]
    fn legacy_installs_are_never_updatable() {
        let resources = vec![resource(1, true), resource(2, false)];
        assert!(matches!(
            plan(Some(LocalGameVersion::Legacy), &resources),
            UpdatePlan::NotUpdatable
        ));
        assert!(!should_update_game(LocalGameVersion::Legacy, &resources));
    }

    #[test]
    fn empty_resource_list_means_up_to_date() {
        assert!(matches!(
            plan(Some(LocalGameVersion::Version(3)), &[]),
            UpdatePlan::UpToDate
        ));
    }

    #[test]
    fn current_install_is_up_to_date() {
        let resources = vec![resource(1, true), resource(2, false)];
        assert!(matches!(
            plan(Some(LocalGameVersion::Version(2)), &resources),
            UpdatePlan::UpToDate
        ));
        assert!(!should_update_game(LocalGameVersion::Version(2), &resources));
    }

    #[test]
    fn fresh_install_takes_the_newest_full_package() {
        let resources = vec![
            resource(1, true),
            resource(2, false),
            resource(3, true),
            resource(4, false),
        ];
        let plan = plan(None, &resources);
        let versions: Vec<u32> = plan
            .resources()
            .iter()
            .map(|r| r.internal_version)
            .collect();
        assert_eq!(versions, [3]);
        assert!(plan.resources()[0].is_full_package);
    }

    #[test]
    fn fresh_install_without_a_full_package_is_not_updatable() {
        let resources = vec![resource(2, false), resource(3, false)];
        assert!(matches!(plan(None, &resources), UpdatePlan::NotUpdatable));
    }
}
