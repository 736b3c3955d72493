//! Harness configuration
//!
//! Credentials come from the process environment first and then from a
//! `credentials.txt` file (`KEY=VALUE` lines). The file is parsed into a map
//! and never written back into the environment. Everything else is resolved
//! once at startup into an immutable [`HarnessConfig`].

use crate::agent::AgentBudget;
use crate::diff::{PathFixups, PathRewrite};
use crate::harness::AttemptSettings;
use crate::llm::{ChatGateway, ModelSpec, OpenAiCompatClient};
use crate::workspace::{GitTimeouts, GitWorkspaceProvider};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const CREDENTIALS_FILE: &str = "credentials.txt";
pub const DEFAULT_WORKERS: usize = 12;
pub const DEFAULT_REMOTE_BASE: &str = "https://github.com";

/// Secrets and switches looked up by name: environment first, then file.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    file_values: HashMap<String, String>,
}

impl Credentials {
    pub fn parse(text: &str) -> Self {
        let mut file_values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if !key.is_empty() && !value.is_empty() {
                file_values.insert(key.to_string(), value.to_string());
            }
        }
        Self { file_values }
    }

    /// Load from `path`. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read credentials '{}'", path.display()))
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.file_values.get(key).cloned())
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => value.trim() != "0",
            None => default,
        }
    }

    fn number(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// How to reach one OpenAI-compatible provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    /// Full chat-completions endpoint URL.
    pub base_url: String,
    pub api_key_env: String,
    /// Credential name that overrides `base_url` when set.
    #[serde(default)]
    pub base_url_env: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ProviderProfile {
    pub fn builtin() -> Vec<ProviderProfile> {
        vec![
            ProviderProfile {
                name: "openrouter".to_string(),
                base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
                api_key_env: "OPENROUTER_API_KEY".to_string(),
                base_url_env: Some("OPENROUTER_BASE_URL".to_string()),
                headers: BTreeMap::from([
                    ("HTTP-Referer".to_string(), "https://example.com".to_string()),
                    ("X-Title".to_string(), "SWE-bench Harness".to_string()),
                ]),
            },
            ProviderProfile {
                name: "chutes".to_string(),
                base_url: "https://llm.chutes.ai/v1/chat/completions".to_string(),
                api_key_env: "CHUTES_API_KEY".to_string(),
                base_url_env: Some("CHUTES_BASE_URL".to_string()),
                headers: BTreeMap::new(),
            },
        ]
    }

    /// Effective endpoint, validated as an http(s) URL.
    pub fn endpoint(&self, credentials: &Credentials) -> Result<Url> {
        let raw = self
            .base_url_env
            .as_deref()
            .and_then(|key| credentials.get(key))
            .unwrap_or_else(|| self.base_url.clone());
        let url = Url::parse(raw.trim())
            .with_context(|| format!("Invalid base URL for provider '{}': {}", self.name, raw))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Base URL for provider '{}' must be http(s): {}",
                self.name,
                url
            ));
        }
        Ok(url)
    }
}

/// The TOML file naming the models to run, plus optional provider and
/// path-fixup overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsFile {
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub providers: Vec<ProviderProfile>,
    #[serde(default)]
    pub path_fixups: HashMap<String, Vec<PathRewrite>>,
}

impl ModelsFile {
    pub fn parse(text: &str) -> Result<Self> {
        let file: ModelsFile = toml::from_str(text).context("Invalid models config")?;
        if file.models.is_empty() {
            return Err(anyhow!("Models config lists no [[models]]"));
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read models config '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("in '{}'", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub cache_root: PathBuf,
    pub remote_base: String,
    pub timeouts: GitTimeouts,
}

impl WorkspaceSettings {
    fn resolve(credentials: &Credentials) -> Self {
        let cache_root = credentials
            .get("REPO_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::cache_dir().map(|d| d.join("patchbench").join("repos")))
            .unwrap_or_else(|| PathBuf::from(".cache/repos"));
        Self {
            cache_root,
            remote_base: credentials
                .get("REPO_REMOTE_BASE")
                .unwrap_or_else(|| DEFAULT_REMOTE_BASE.to_string()),
            timeouts: GitTimeouts::default(),
        }
    }
}

/// Everything a run needs, resolved once and shared read-only.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub credentials: Credentials,
    pub providers: BTreeMap<String, ProviderProfile>,
    pub fixups: PathFixups,
    pub workspace: WorkspaceSettings,
    pub attempts: AttemptSettings,
    pub workers: usize,
}

impl HarnessConfig {
    /// Resolve configuration from credentials and the models file. Providers
    /// declared in the file replace built-ins of the same name.
    pub fn resolve(credentials: Credentials, models: &ModelsFile) -> Result<Self> {
        let mut providers: BTreeMap<String, ProviderProfile> = ProviderProfile::builtin()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        for profile in &models.providers {
            providers.insert(profile.name.to_ascii_lowercase(), profile.clone());
        }
        for profile in providers.values() {
            profile.endpoint(&credentials)?;
        }

        let attempts = AttemptSettings {
            preflight: credentials.flag("PREFLIGHT_APPLY", true),
            hints: credentials.flag("REPO_HINTS", true),
            agent_budget: AgentBudget::default(),
            ..AttemptSettings::default()
        };
        let workers = credentials.number("WORKERS", DEFAULT_WORKERS).max(1);

        Ok(Self {
            workspace: WorkspaceSettings::resolve(&credentials),
            fixups: PathFixups::builtin().with_overrides(models.path_fixups.clone()),
            providers,
            attempts,
            workers,
            credentials,
        })
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn workspace_provider(&self) -> GitWorkspaceProvider {
        GitWorkspaceProvider::new(&self.workspace.cache_root, self.workspace.remote_base.clone())
            .with_timeouts(self.workspace.timeouts)
    }

    /// Build the gateway for `model`. Fails if the provider is unknown or its
    /// API key is not configured.
    pub fn make_gateway(&self, model: &ModelSpec) -> Result<Arc<dyn ChatGateway>> {
        let name = model.provider.to_ascii_lowercase();
        let profile = self
            .providers
            .get(&name)
            .ok_or_else(|| anyhow!("Unknown provider: {}", model.provider))?;
        let api_key = self.credentials.get(&profile.api_key_env).ok_or_else(|| {
            anyhow!(
                "{} not set; put it in {} or the environment",
                profile.api_key_env,
                CREDENTIALS_FILE
            )
        })?;
        let endpoint = profile.endpoint(&self.credentials)?;
        let headers = profile
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let client = OpenAiCompatClient::new(
            endpoint.as_str(),
            api_key,
            model.model_name.clone(),
            headers,
            Duration::from_secs(crate::llm::client::REQUEST_TIMEOUT_SECS),
        )?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS_TOML: &str = r#"
[[models]]
provider = "openrouter"
model = "qwen/qwen-2.5-coder-32b-instruct"
seed = 7

[[models]]
provider = "local"
model = "coder"

[[providers]]
name = "local"
base_url = "http://127.0.0.1:8000/v1/chat/completions"
api_key_env = "PATCHBENCH_TEST_LOCAL_KEY"

[path_fixups]
"acme/widgets" = [{ from = "widgets/", to = "src/widgets/" }]
"#;

    #[test]
    fn test_credentials_parse_skips_comments_and_blanks() {
        let creds = Credentials::parse(
            "# keys\nPATCHBENCH_TEST_A = one\n\nnot a pair\nPATCHBENCH_TEST_B=\n=orphan\nPATCHBENCH_TEST_C=x=y\n",
        );
        assert_eq!(creds.get("PATCHBENCH_TEST_A").as_deref(), Some("one"));
        assert_eq!(creds.get("PATCHBENCH_TEST_B"), None);
        assert_eq!(creds.get("PATCHBENCH_TEST_C").as_deref(), Some("x=y"));
    }

    #[test]
    fn test_environment_wins_over_file() {
        // PATH is always set in the test environment.
        let creds = Credentials::parse("PATH=/from/file\n");
        assert_ne!(creds.get("PATH").as_deref(), Some("/from/file"));
    }

    #[test]
    fn test_missing_credentials_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let creds = Credentials::load(&dir.path().join("credentials.txt")).unwrap();
        assert_eq!(creds.get("PATCHBENCH_TEST_NOPE"), None);
    }

    #[test]
    fn test_models_file_parses_models_providers_and_fixups() {
        let file = ModelsFile::parse(MODELS_TOML).unwrap();
        assert_eq!(file.models.len(), 2);
        assert_eq!(file.models[0].qualified_name(), "openrouter:qwen/qwen-2.5-coder-32b-instruct");
        assert_eq!(file.models[0].seed, 7);
        assert_eq!(file.models[1].seed, 42);
        assert_eq!(file.providers[0].name, "local");
        assert_eq!(file.path_fixups["acme/widgets"][0].to, "src/widgets/");
    }

    #[test]
    fn test_models_file_requires_models() {
        assert!(ModelsFile::parse("[[providers]]\nname='x'\nbase_url='http://x'\napi_key_env='K'\n").is_err());
        assert!(ModelsFile::parse("models = 3").is_err());
    }

    #[test]
    fn test_resolve_merges_providers_and_fixups() {
        let models = ModelsFile::parse(MODELS_TOML).unwrap();
        let config = HarnessConfig::resolve(Credentials::default(), &models).unwrap();

        assert!(config.providers.contains_key("openrouter"));
        assert!(config.providers.contains_key("chutes"));
        assert!(config.providers.contains_key("local"));
        assert_eq!(
            config.fixups.rewrite_path("acme/widgets", "widgets/parse.py"),
            "src/widgets/parse.py"
        );
        assert_eq!(
            config.fixups.rewrite_path("pytest-dev/pytest", "_pytest/main.py"),
            "src/_pytest/main.py"
        );
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let mut models = ModelsFile::parse(MODELS_TOML).unwrap();
        models.providers[0].base_url = "ftp://example.com/chat".to_string();
        assert!(HarnessConfig::resolve(Credentials::default(), &models).is_err());

        models.providers[0].base_url = "not a url".to_string();
        assert!(HarnessConfig::resolve(Credentials::default(), &models).is_err());
    }

    #[test]
    fn test_make_gateway_needs_known_provider_and_key() {
        let models = ModelsFile::parse(MODELS_TOML).unwrap();
        let config = HarnessConfig::resolve(Credentials::default(), &models).unwrap();
        let unknown = ModelSpec::new("nowhere", "m", 42);
        assert!(config.make_gateway(&unknown).is_err());

        let local = &models.models[1];
        let err = config.make_gateway(local).err().unwrap();
        assert!(err.to_string().contains("PATCHBENCH_TEST_LOCAL_KEY not set"));

        let creds = Credentials::parse("PATCHBENCH_TEST_LOCAL_KEY=secret\n");
        let config = HarnessConfig::resolve(creds, &models).unwrap();
        assert!(config.make_gateway(local).is_ok());
    }
}
