//! AWS credential and profile management
//!
//! Profiles come from the shared credentials file and the config file
//! (`~/.aws/credentials`, `~/.aws/config`, or the paths named by
//! `AWS_SHARED_CREDENTIALS_FILE` / `AWS_CONFIG_FILE`). The files are re-read
//! on every [`ProfileManager::list_profiles`] call; secrets are never kept.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::s3::client::S3Client;
use crate::s3::error::{S3Error, S3Result};
use crate::s3::session::Session;
use crate::s3::store::ObjectStore;

/// Region used when a profile names none
pub const DEFAULT_REGION: &str = "us-east-1";

/// Where a profile gets its credentials from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialSource {
    /// aws_access_key_id / aws_secret_access_key in the credentials file
    StaticKeys,
    /// role_arn with a source_profile or credential_source
    AssumeRole,
    /// AWS SSO / IAM Identity Center
    Sso,
    /// credential_process helper
    Process,
    /// Nothing explicit; the SDK falls back to environment or instance roles
    Unspecified,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::StaticKeys => "Static Credentials",
            CredentialSource::AssumeRole => "Assume Role",
            CredentialSource::Sso => "SSO",
            CredentialSource::Process => "Credential Process",
            CredentialSource::Unspecified => "Unspecified",
        }
    }
}

/// A named profile as resolved from the credential store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub source: CredentialSource,
    pub region: String,
    pub role_arn: Option<String>,
    pub source_profile: Option<String>,
    pub credential_source: Option<String>,
    pub sso_start_url: Option<String>,
    pub sso_region: Option<String>,
    pub sso_account_id: Option<String>,
    pub sso_role_name: Option<String>,
    pub sso_session: Option<String>,
    /// Why the profile cannot be used, if it cannot
    pub problem: Option<String>,
}

impl Profile {
    /// A profile with no credential settings, for sessions over custom endpoints
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: CredentialSource::Unspecified,
            region: DEFAULT_REGION.to_string(),
            role_arn: None,
            source_profile: None,
            credential_source: None,
            sso_start_url: None,
            sso_region: None,
            sso_account_id: None,
            sso_role_name: None,
            sso_session: None,
            problem: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.problem.is_none()
    }
}

/// Locations of the two credential store files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileStore {
    pub config_path: PathBuf,
    pub credentials_path: PathBuf,
}

impl ProfileStore {
    /// Explicit file locations
    pub fn at(config_path: impl Into<PathBuf>, credentials_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            credentials_path: credentials_path.into(),
        }
    }

    /// Standard locations, honouring the SDK's environment overrides
    pub fn default_locations() -> S3Result<Self> {
        let aws_dir = || {
            dirs::home_dir()
                .map(|h| h.join(".aws"))
                .ok_or_else(|| S3Error::Configuration("cannot determine home directory".to_string()))
        };

        let config_path = match std::env::var_os("AWS_CONFIG_FILE") {
            Some(p) => PathBuf::from(p),
            None => aws_dir()?.join("config"),
        };
        let credentials_path = match std::env::var_os("AWS_SHARED_CREDENTIALS_FILE") {
            Some(p) => PathBuf::from(p),
            None => aws_dir()?.join("credentials"),
        };

        Ok(Self::at(config_path, credentials_path))
    }

    /// Directory holding the config file, for an "open config folder" action
    pub fn directory(&self) -> Option<&Path> {
        self.config_path.parent()
    }
}

/// One `[section]` of an INI-style store file
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    entries: HashMap<String, String>,
}

/// Parse AWS-style INI content. Lines that are neither comments, section
/// headers nor `key = value` pairs make the whole file malformed.
fn parse_ini(content: &str, origin: &Path) -> S3Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let malformed = |reason: &str| {
            S3Error::Configuration(format!(
                "{}:{}: {}",
                origin.display(),
                index + 1,
                reason
            ))
        };

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| malformed("unterminated section header"))?
                .trim();
            if name.is_empty() {
                return Err(malformed("empty section name"));
            }
            sections.push(Section {
                name: name.to_string(),
                entries: HashMap::new(),
            });
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| malformed("expected 'key = value'"))?;
        let section = sections
            .last_mut()
            .ok_or_else(|| malformed("setting outside of any section"))?;
        section
            .entries
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(sections)
}

fn read_store_file(path: &Path) -> S3Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(S3Error::Configuration(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Manages AWS profiles from the credential store
pub struct ProfileManager {
    store: ProfileStore,
    profiles: HashMap<String, Profile>,
}

impl ProfileManager {
    /// Create a manager over the standard locations and load it
    pub fn new() -> S3Result<Self> {
        Self::with_store(ProfileStore::default_locations()?)
    }

    /// Create a manager over explicit locations and load it
    pub fn with_store(store: ProfileStore) -> S3Result<Self> {
        let mut manager = Self {
            store,
            profiles: HashMap::new(),
        };
        manager.reload()?;
        Ok(manager)
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// Re-read both files from disk
    pub fn reload(&mut self) -> S3Result<()> {
        let credentials = read_store_file(&self.store.credentials_path)?;
        let config = read_store_file(&self.store.config_path)?;

        if credentials.is_none() && config.is_none() {
            return Err(S3Error::Configuration(format!(
                "no credential store found at {} or {}",
                self.store.credentials_path.display(),
                self.store.config_path.display()
            )));
        }

        let mut profiles: HashMap<String, Profile> = HashMap::new();

        if let Some(content) = credentials {
            for section in parse_ini(&content, &self.store.credentials_path)? {
                let profile = profiles
                    .entry(section.name.clone())
                    .or_insert_with(|| Profile::named(&section.name));
                if section.entries.contains_key("aws_access_key_id")
                    && section.entries.contains_key("aws_secret_access_key")
                {
                    profile.source = CredentialSource::StaticKeys;
                }
                if let Some(region) = section.entries.get("region") {
                    profile.region = region.clone();
                }
            }
        }

        if let Some(content) = config {
            for section in parse_ini(&content, &self.store.config_path)? {
                let name = if section.name == "default" {
                    "default"
                } else if let Some(name) = section.name.strip_prefix("profile ") {
                    name.trim()
                } else {
                    // sso-session, services and friends are not profiles
                    continue;
                };

                let profile = profiles
                    .entry(name.to_string())
                    .or_insert_with(|| Profile::named(name));
                apply_config_entries(profile, &section.entries);
            }
        }

        for profile in profiles.values_mut() {
            profile.source = classify_source(profile);
        }

        let names: Vec<String> = profiles.keys().cloned().collect();
        for name in names {
            let problem = validate_profile(&profiles, &name);
            if let Some(profile) = profiles.get_mut(&name) {
                profile.problem = problem;
            }
        }

        tracing::info!("Loaded {} AWS profile(s)", profiles.len());
        self.profiles = profiles;
        Ok(())
    }

    /// Read the store and return profile identifiers, `default` first
    pub fn list_profiles(&mut self) -> S3Result<Vec<String>> {
        self.reload()?;
        Ok(self.profile_names())
    }

    /// Profile identifiers from the last load, `default` first
    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.profiles.keys().cloned().collect();
        names.sort();
        if let Some(pos) = names.iter().position(|n| n == "default") {
            let default = names.remove(pos);
            names.insert(0, default);
        }
        names
    }

    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn invalid_profiles(&self) -> Vec<&Profile> {
        self.profiles.values().filter(|p| !p.is_valid()).collect()
    }

    /// Resolve `profile_id` against a fresh read of the store
    pub fn resolve(&mut self, profile_id: &str) -> S3Result<Profile> {
        self.reload()?;
        let profile = self
            .profiles
            .get(profile_id)
            .ok_or_else(|| S3Error::UnknownProfile(profile_id.to_string()))?;
        if let Some(problem) = &profile.problem {
            return Err(S3Error::Configuration(format!(
                "profile '{}': {}",
                profile_id, problem
            )));
        }
        Ok(profile.clone())
    }

    /// Open an authenticated session against AWS for `profile_id`
    pub async fn open_session(&mut self, profile_id: &str) -> S3Result<Session> {
        let profile = self.resolve(profile_id)?;
        let client = S3Client::new(Some(&profile.name)).await;
        Session::establish(profile, Arc::new(client)).await
    }

    /// Open a session for `profile_id` over an already built store
    pub async fn open_session_with(
        &mut self,
        profile_id: &str,
        store: Arc<dyn ObjectStore>,
    ) -> S3Result<Session> {
        let profile = self.resolve(profile_id)?;
        Session::establish(profile, store).await
    }
}

fn apply_config_entries(profile: &mut Profile, entries: &HashMap<String, String>) {
    for (key, value) in entries {
        let value = Some(value.clone());
        match key.as_str() {
            "region" => profile.region = value.unwrap_or_default(),
            "role_arn" => profile.role_arn = value,
            "source_profile" => profile.source_profile = value,
            "credential_source" => profile.credential_source = value,
            "sso_start_url" => profile.sso_start_url = value,
            "sso_region" => profile.sso_region = value,
            "sso_account_id" => profile.sso_account_id = value,
            "sso_role_name" => profile.sso_role_name = value,
            "sso_session" => profile.sso_session = value,
            "credential_process" if profile.source == CredentialSource::Unspecified => {
                profile.source = CredentialSource::Process
            }
            _ => {}
        }
    }
}

fn classify_source(profile: &Profile) -> CredentialSource {
    if profile.sso_start_url.is_some()
        || profile.sso_session.is_some()
        || (profile.sso_account_id.is_some() && profile.sso_role_name.is_some())
    {
        CredentialSource::Sso
    } else if profile.role_arn.is_some() {
        CredentialSource::AssumeRole
    } else {
        profile.source
    }
}

/// Why `name` cannot be used, or `None` when it looks usable
fn validate_profile(profiles: &HashMap<String, Profile>, name: &str) -> Option<String> {
    let profile = profiles.get(name)?;

    match profile.source {
        CredentialSource::Sso => {
            let mut missing = Vec::new();
            if profile.sso_session.is_none() {
                if profile.sso_start_url.is_none() {
                    missing.push("sso_start_url");
                }
                if profile.sso_region.is_none() {
                    missing.push("sso_region");
                }
            }
            if profile.sso_account_id.is_none() {
                missing.push("sso_account_id");
            }
            if profile.sso_role_name.is_none() {
                missing.push("sso_role_name");
            }
            if missing.is_empty() {
                None
            } else {
                Some(format!("SSO profile missing: {}", missing.join(", ")))
            }
        }
        CredentialSource::AssumeRole => match (&profile.source_profile, &profile.credential_source) {
            (Some(source), _) => validate_role_chain(profiles, name, source).err(),
            (None, Some(_)) => None,
            (None, None) => {
                Some("assume-role profile needs source_profile or credential_source".to_string())
            }
        },
        _ => None,
    }
}

/// Follow source_profile links until a credential-bearing profile is found
fn validate_role_chain(
    profiles: &HashMap<String, Profile>,
    start: &str,
    source: &str,
) -> Result<(), String> {
    let mut visited = vec![start.to_string()];
    let mut current = source.to_string();

    loop {
        if visited.contains(&current) {
            return Err(format!(
                "circular assume-role chain: {} -> {}",
                visited.join(" -> "),
                current
            ));
        }

        let profile = profiles
            .get(&current)
            .ok_or_else(|| format!("source profile '{}' not found", current))?;

        match (&profile.source, &profile.source_profile) {
            (CredentialSource::AssumeRole, Some(next)) => {
                visited.push(current.clone());
                current = next.clone();
            }
            _ => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_store(credentials: Option<&str>, config: Option<&str>) -> (TempDir, ProfileStore) {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::at(dir.path().join("config"), dir.path().join("credentials"));
        if let Some(c) = credentials {
            fs::write(&store.credentials_path, c).unwrap();
        }
        if let Some(c) = config {
            fs::write(&store.config_path, c).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn test_missing_store_is_configuration_error() {
        let (_dir, store) = write_store(None, None);
        let err = ProfileManager::with_store(store).err().unwrap();
        assert!(matches!(err, S3Error::Configuration(_)));
    }

    #[test]
    fn test_empty_store_lists_nothing() {
        let (_dir, store) = write_store(Some("# no profiles yet\n"), None);
        let mut manager = ProfileManager::with_store(store).unwrap();
        assert!(manager.list_profiles().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_store_reports_line() {
        let (_dir, store) = write_store(Some("[work]\nthis is not a setting\n"), None);
        match ProfileManager::with_store(store) {
            Err(S3Error::Configuration(msg)) => assert!(msg.contains(":2:"), "{}", msg),
            other => panic!("expected configuration error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unterminated_header_is_malformed() {
        let (_dir, store) = write_store(None, Some("[profile broken\nregion = eu-west-1\n"));
        assert!(ProfileManager::with_store(store).is_err());
    }

    #[test]
    fn test_profiles_merged_from_both_files() {
        let (_dir, store) = write_store(
            Some("[work]\naws_access_key_id = AKIA\naws_secret_access_key = s3cr3t\n\n[default]\naws_access_key_id = A\naws_secret_access_key = B\n"),
            Some("[default]\nregion = eu-west-1\n\n[profile personal]\nregion = us-west-2\ncredential_process = /usr/bin/creds\n\n[sso-session corp]\nsso_region = us-east-1\n"),
        );
        let mut manager = ProfileManager::with_store(store).unwrap();
        assert_eq!(manager.list_profiles().unwrap(), vec!["default", "personal", "work"]);

        let work = manager.get_profile("work").unwrap();
        assert_eq!(work.source, CredentialSource::StaticKeys);
        assert_eq!(work.region, DEFAULT_REGION);

        let personal = manager.get_profile("personal").unwrap();
        assert_eq!(personal.source, CredentialSource::Process);
        assert_eq!(personal.region, "us-west-2");

        assert_eq!(manager.get_profile("default").unwrap().region, "eu-west-1");
        assert!(manager.get_profile("corp").is_none());
    }

    #[test]
    fn test_list_profiles_rereads_store() {
        let (_dir, store) = write_store(Some("[a]\n"), None);
        let path = store.credentials_path.clone();
        let mut manager = ProfileManager::with_store(store).unwrap();
        assert_eq!(manager.list_profiles().unwrap(), vec!["a"]);

        fs::write(&path, "[a]\n[b]\n").unwrap();
        assert_eq!(manager.list_profiles().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_resolve_unknown_profile() {
        let (_dir, store) = write_store(Some("[work]\n"), None);
        let mut manager = ProfileManager::with_store(store).unwrap();
        assert!(matches!(manager.resolve("play"), Err(S3Error::UnknownProfile(p)) if p == "play"));
    }

    #[test]
    fn test_sso_profile_validation() {
        let (_dir, store) = write_store(
            None,
            Some("[profile full]\nsso_start_url = https://x.awsapps.com/start\nsso_region = us-east-1\nsso_account_id = 123456789012\nsso_role_name = ReadOnly\n\n[profile partial]\nsso_start_url = https://x.awsapps.com/start\n\n[profile session]\nsso_session = corp\nsso_account_id = 1\nsso_role_name = r\n"),
        );
        let manager = ProfileManager::with_store(store).unwrap();
        assert!(manager.get_profile("full").unwrap().is_valid());
        assert!(manager.get_profile("session").unwrap().is_valid());

        let partial = manager.get_profile("partial").unwrap();
        assert_eq!(partial.source, CredentialSource::Sso);
        let problem = partial.problem.as_deref().unwrap();
        assert!(problem.contains("sso_region"));
        assert!(problem.contains("sso_account_id"));
        assert!(problem.contains("sso_role_name"));
    }

    #[test]
    fn test_assume_role_chain_valid_and_cyclic() {
        let (_dir, store) = write_store(
            Some("[base]\naws_access_key_id = A\naws_secret_access_key = B\n"),
            Some("[profile hop]\nrole_arn = arn:aws:iam::1:role/Hop\nsource_profile = base\n\n[profile ping]\nrole_arn = arn:aws:iam::1:role/Ping\nsource_profile = pong\n\n[profile pong]\nrole_arn = arn:aws:iam::1:role/Pong\nsource_profile = ping\n\n[profile orphan]\nrole_arn = arn:aws:iam::1:role/O\nsource_profile = ghost\n"),
        );
        let mut manager = ProfileManager::with_store(store).unwrap();
        assert!(manager.get_profile("hop").unwrap().is_valid());

        let ping = manager.get_profile("ping").unwrap();
        assert!(ping.problem.as_deref().unwrap().contains("circular"));
        let orphan = manager.get_profile("orphan").unwrap();
        assert!(orphan.problem.as_deref().unwrap().contains("ghost"));
        assert_eq!(manager.invalid_profiles().len(), 3);

        assert!(matches!(manager.resolve("ping"), Err(S3Error::Configuration(_))));
    }

    #[test]
    fn test_assume_role_with_credential_source() {
        let (_dir, store) = write_store(
            None,
            Some("[profile ec2]\nrole_arn = arn:aws:iam::1:role/R\ncredential_source = Ec2InstanceMetadata\n"),
        );
        let manager = ProfileManager::with_store(store).unwrap();
        let ec2 = manager.get_profile("ec2").unwrap();
        assert_eq!(ec2.source, CredentialSource::AssumeRole);
        assert!(ec2.is_valid());
    }

    #[test]
    fn test_store_directory() {
        let store = ProfileStore::at("/home/u/.aws/config", "/home/u/.aws/credentials");
        assert_eq!(store.directory(), Some(Path::new("/home/u/.aws")));
    }
}
