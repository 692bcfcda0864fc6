use super::config::{ScreeningConfig, TestKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TestRegistration<'a> {
    pub name: &'a str,
    pub kind: TestKind,
    pub suite_position: Option<usize>,
}

impl TestRegistration<'_> {
    pub fn enabled(&self) -> bool {
        self.suite_position.is_some()
    }
}

// Every configured profile, in file order. Profiles outside the suite stay
// registered for standalone runs.
pub fn test_registry(config: &ScreeningConfig) -> Vec<TestRegistration<'_>> {
    config
        .profiles
        .iter()
        .map(|profile| TestRegistration {
            name: profile.name.as_str(),
            kind: profile.kind,
            suite_position: config
                .suite
                .tests
                .iter()
                .position(|name| *name == profile.name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::config::active_config;

    #[test]
    fn default_registry_marks_suite_members() {
        let config = active_config().expect("default config should validate");
        let registry = test_registry(config);
        assert_eq!(registry.len(), config.profiles.len());

        let enabled: Vec<(&str, Option<usize>)> = registry
            .iter()
            .filter(|r| r.enabled())
            .map(|r| (r.name, r.suite_position))
            .collect();
        assert_eq!(
            enabled,
            vec![
                ("Balance", Some(0)),
                ("Eye Tracking", Some(1)),
                ("Speech", Some(2))
            ]
        );
        let gait = registry
            .iter()
            .find(|r| r.name == "Gait")
            .expect("gait is registered");
        assert_eq!(gait.kind, TestKind::Motion);
        assert!(!gait.enabled());
    }
}
