use sensor_core::{
    config::{ConfigError, ModuleConfig},
    event::EventType,
};

use crate::policy::{Policy, PolicyMode, PolicySet};

/// Extract the admission policy from the module configuration.
///
/// ```text
/// enabled_events = link,mkdir
/// always_enabled_events =
/// link_mode = deny
/// link_basename_approvers = passwd,shadow
/// ```
impl TryFrom<&ModuleConfig> for PolicySet {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let enabled: Vec<EventType> =
            config.get_list_with_default("enabled_events", EventType::ALL.to_vec())?;
        let always_enabled: Vec<EventType> = config.get_list("always_enabled_events")?;
        let mut policy = PolicySet::default()
            .with_enabled(&enabled)
            .with_always_enabled(&always_enabled);
        for event_type in EventType::ALL {
            let mode = config.with_default(&format!("{event_type}_mode"), PolicyMode::NoFilter)?;
            let basename_approvers = config
                .get_list::<String>(&format!("{event_type}_basename_approvers"))?
                .into_iter()
                .collect();
            policy = policy.with_policy(
                event_type,
                Policy {
                    mode,
                    basename_approvers,
                },
            );
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = PolicySet::try_from(&ModuleConfig::default()).unwrap();
        assert!(policy.is_enabled(EventType::Link));
        assert!(policy.is_enabled(EventType::Mkdir));
        assert_eq!(policy.mode(EventType::Mkdir), PolicyMode::NoFilter);
    }

    #[test]
    fn full_config() {
        let config: ModuleConfig = [
            ("enabled_events", "mkdir"),
            ("always_enabled_events", "link"),
            ("link_mode", "deny"),
            ("link_basename_approvers", "passwd, shadow"),
        ]
        .into_iter()
        .collect();
        let policy = PolicySet::try_from(&config).unwrap();
        assert!(!policy.is_enabled(EventType::Link));
        assert!(policy.is_always_enabled(EventType::Link));
        let link = policy.policy(EventType::Link);
        assert_eq!(link.mode, PolicyMode::Deny);
        assert!(link.basename_approvers.contains("shadow"));
    }

    #[test]
    fn invalid_values() {
        let config: ModuleConfig = [("link_mode", "sometimes")].into_iter().collect();
        assert!(matches!(
            PolicySet::try_from(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
        let config: ModuleConfig = [("enabled_events", "link,rename")].into_iter().collect();
        assert!(PolicySet::try_from(&config).is_err());
    }
}
