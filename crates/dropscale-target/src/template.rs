//! Droplet template — the validated parameters of one worker group.

use std::collections::HashMap;
use std::time::Duration;

use dropscale_vault::IntroductionConfig;

use crate::error::TargetError;

pub const DEFAULT_INTRODUCTION_FILENAME: &str = "/run/secure-introduction";
const DEFAULT_SECRET_VALIDITY: Duration = Duration::from_secs(5 * 60);

const KEY_NAME: &str = "name";
const KEY_REGION: &str = "region";
const KEY_SIZE: &str = "size";
const KEY_VPC_UUID: &str = "vpc_uuid";
const KEY_SNAPSHOT_ID: &str = "snapshot_id";
const KEY_SSH_KEYS: &str = "ssh_keys";
const KEY_TAGS: &str = "tags";
const KEY_USER_DATA: &str = "user_data";
const KEY_IPV6: &str = "ipv6";
const KEY_CREATE_RESERVED: &str = "create_reserved_addresses";
const KEY_RESERVE_IPV4: &str = "reserve_ipv4_addresses";
const KEY_RESERVE_IPV6: &str = "reserve_ipv6_addresses";
const KEY_APPROLE: &str = "secure_introduction_approle";
const KEY_TAG_PREFIX: &str = "secure_introduction_tag_prefix";
const KEY_FILENAME: &str = "secure_introduction_filename";
const KEY_SECRET_VALIDITY: &str = "secure_introduction_secret_validity";

/// Per-call config overrides agent config on conflict.
pub(crate) struct ConfigView<'a> {
    pub call: &'a HashMap<String, String>,
    pub agent: &'a HashMap<String, String>,
}

impl ConfigView<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.call
            .get(key)
            .or_else(|| self.agent.get(key))
            .map(String::as_str)
    }

    fn required(&self, key: &'static str) -> Result<&str, TargetError> {
        self.get(key).ok_or(TargetError::MissingConfig(key))
    }
}

/// Everything needed to materialize one worker, immutable within a
/// scale call.
#[derive(Debug, Clone)]
pub struct DropletTemplate {
    pub name: String,
    pub region: String,
    pub size: String,
    pub vpc: String,
    pub snapshot_id: u64,
    pub ssh_keys: Vec<String>,
    /// Always includes `name` as the group tag.
    pub tags: Vec<String>,
    /// Literal user-data, or a path to a file holding it.
    pub user_data: String,
    pub ipv6: bool,
    pub create_reserved_addresses: bool,
    pub reserve_ipv4: bool,
    pub reserve_ipv6: bool,
    pub approle: String,
    pub tag_prefix: String,
    pub filename: String,
    pub secret_validity: Duration,
}

impl DropletTemplate {
    pub(crate) fn from_config(view: &ConfigView<'_>) -> Result<Self, TargetError> {
        let name = view.required(KEY_NAME)?.to_string();
        let region = view.required(KEY_REGION)?.to_string();
        let size = view.required(KEY_SIZE)?.to_string();
        let vpc = view.required(KEY_VPC_UUID)?.to_string();
        let snapshot_id = view
            .required(KEY_SNAPSHOT_ID)?
            .parse::<u64>()
            .map_err(|err| TargetError::InvalidConfig {
                key: KEY_SNAPSHOT_ID,
                reason: err.to_string(),
            })?;

        let ipv6 = parse_bool(KEY_IPV6, view.get(KEY_IPV6))?;
        let create_reserved_addresses =
            parse_bool(KEY_CREATE_RESERVED, view.get(KEY_CREATE_RESERVED))?;
        let reserve_ipv4 = parse_bool(KEY_RESERVE_IPV4, view.get(KEY_RESERVE_IPV4))?;
        let reserve_ipv6 = parse_bool(KEY_RESERVE_IPV6, view.get(KEY_RESERVE_IPV6))?;

        let approle = view.get(KEY_APPROLE).unwrap_or_default().to_string();
        let tag_prefix = view.get(KEY_TAG_PREFIX).unwrap_or_default().to_string();

        // An approle without a delivery channel can never hand the
        // credential to the worker.
        if !approle.is_empty() && tag_prefix.is_empty() && !reserve_ipv4 && !reserve_ipv6 {
            return Err(TargetError::NoIntroductionChannel);
        }

        let filename = view
            .get(KEY_FILENAME)
            .unwrap_or(DEFAULT_INTRODUCTION_FILENAME)
            .to_string();
        let secret_validity = match view.get(KEY_SECRET_VALIDITY) {
            Some(value) => parse_duration(KEY_SECRET_VALIDITY, value)?,
            None => DEFAULT_SECRET_VALIDITY,
        };

        let mut tags = vec![name.clone()];
        if let Some(raw) = view.get(KEY_TAGS)
            && !raw.is_empty()
        {
            tags.extend(raw.split(',').map(str::to_string));
        }

        let mut ssh_keys = Vec::new();
        if let Some(raw) = view.get(KEY_SSH_KEYS)
            && !raw.is_empty()
        {
            ssh_keys.extend(raw.split(',').map(str::to_string));
        }

        Ok(Self {
            name,
            region,
            size,
            vpc,
            snapshot_id,
            ssh_keys,
            tags,
            user_data: view.get(KEY_USER_DATA).unwrap_or_default().to_string(),
            ipv6,
            create_reserved_addresses,
            reserve_ipv4,
            reserve_ipv6,
            approle,
            tag_prefix,
            filename,
            secret_validity,
        })
    }

    /// Secure-introduction parameters, when an approle is configured.
    pub fn introduction(&self) -> Option<IntroductionConfig> {
        if self.approle.is_empty() {
            return None;
        }
        Some(IntroductionConfig {
            approle: self.approle.clone(),
            tag_prefix: self.tag_prefix.clone(),
            filename: self.filename.clone(),
            secret_ttl: self.secret_validity,
            wrap_ttl: self.secret_validity,
        })
    }
}

/// Parse a permissive boolean: `true`/`1` and `false`/`0`.
fn parse_bool(key: &'static str, value: Option<&str>) -> Result<bool, TargetError> {
    match value.unwrap_or("false") {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(TargetError::InvalidConfig {
            key,
            reason: format!("{other:?} is not parseable as a boolean"),
        }),
    }
}

/// Parse a duration string like "30s", "5m", "1h"; a bare number is
/// taken as seconds.
fn parse_duration(key: &'static str, value: &str) -> Result<Duration, TargetError> {
    let value = value.trim();
    let invalid = |reason: String| TargetError::InvalidConfig { key, reason };

    let (digits, multiplier) = if let Some(rest) = value.strip_suffix("ms") {
        return rest
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| invalid(e.to_string()));
    } else if let Some(rest) = value.strip_suffix('h') {
        (rest, 3600)
    } else if let Some(rest) = value.strip_suffix('m') {
        (rest, 60)
    } else if let Some(rest) = value.strip_suffix('s') {
        (rest, 1)
    } else {
        (value, 1)
    };

    digits
        .parse::<u64>()
        .map(|n| Duration::from_secs(n * multiplier))
        .map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> HashMap<String, String> {
        [
            ("name", "mydropletname"),
            ("region", "lon1"),
            ("size", "s-1vcpu-1gb"),
            ("vpc_uuid", "vpc-1234"),
            ("snapshot_id", "12345"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn template(call: &HashMap<String, String>) -> Result<DropletTemplate, TargetError> {
        let agent = HashMap::new();
        DropletTemplate::from_config(&ConfigView { call, agent: &agent })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let t = template(&base_config()).unwrap();
        assert_eq!(t.name, "mydropletname");
        assert_eq!(t.snapshot_id, 12345);
        assert_eq!(t.tags, vec!["mydropletname"]);
        assert!(!t.ipv6);
        assert!(!t.reserve_ipv4);
        assert_eq!(t.filename, DEFAULT_INTRODUCTION_FILENAME);
        assert_eq!(t.secret_validity, Duration::from_secs(300));
        assert!(t.introduction().is_none());
    }

    #[test]
    fn missing_required_key_is_reported() {
        let mut config = base_config();
        config.remove("region");
        assert!(matches!(
            template(&config),
            Err(TargetError::MissingConfig("region"))
        ));
    }

    #[test]
    fn tags_are_appended_after_the_group_tag() {
        let mut config = base_config();
        config.insert("tags".to_string(), "foo,bar,baz".to_string());
        let t = template(&config).unwrap();
        assert_eq!(t.tags, vec!["mydropletname", "foo", "bar", "baz"]);
    }

    #[test]
    fn booleans_parse_permissively() {
        let mut config = base_config();
        config.insert("ipv6".to_string(), "1".to_string());
        config.insert("reserve_ipv4_addresses".to_string(), "true".to_string());
        let t = template(&config).unwrap();
        assert!(t.ipv6);
        assert!(t.reserve_ipv4);

        config.insert("ipv6".to_string(), "yes".to_string());
        assert!(matches!(
            template(&config),
            Err(TargetError::InvalidConfig { key: "ipv6", .. })
        ));
    }

    #[test]
    fn approle_without_any_channel_is_rejected() {
        let mut config = base_config();
        config.insert(
            "secure_introduction_approle".to_string(),
            "role".to_string(),
        );
        assert!(matches!(
            template(&config),
            Err(TargetError::NoIntroductionChannel)
        ));

        // A tag prefix alone is a valid channel...
        config.insert(
            "secure_introduction_tag_prefix".to_string(),
            "intro-".to_string(),
        );
        assert!(template(&config).is_ok());

        // ...and so is a reserved address without a prefix.
        config.remove("secure_introduction_tag_prefix");
        config.insert("reserve_ipv6_addresses".to_string(), "true".to_string());
        let t = template(&config).unwrap();
        let intro = t.introduction().unwrap();
        assert_eq!(intro.approle, "role");
        assert_eq!(intro.secret_ttl, Duration::from_secs(300));
    }

    #[test]
    fn durations_accept_suffixed_forms() {
        assert_eq!(parse_duration("k", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("k", "1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("k", "45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("k", "500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("k", "30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("k", "soon").is_err());
    }

    #[test]
    fn per_call_config_overrides_agent_config() {
        let agent = base_config();
        let mut call = HashMap::new();
        call.insert("size".to_string(), "s-4vcpu-8gb".to_string());
        let t = DropletTemplate::from_config(&ConfigView {
            call: &call,
            agent: &agent,
        })
        .unwrap();
        assert_eq!(t.size, "s-4vcpu-8gb");
        assert_eq!(t.region, "lon1");
    }

    #[test]
    fn invalid_snapshot_id_is_rejected() {
        let mut config = base_config();
        config.insert("snapshot_id".to_string(), "not-a-number".to_string());
        assert!(matches!(
            template(&config),
            Err(TargetError::InvalidConfig {
                key: "snapshot_id",
                ..
            })
        ));
    }
}
