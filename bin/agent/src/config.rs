use std::{path::PathBuf, sync::OnceLock};

use anyhow::{Context, anyhow};
use clap::Parser;
use colored::Colorize;
use indexmap::IndexMap;
use logger::{LogConfig, LogLevel, StdioLogMode};
use serde::Deserialize;

pub fn agent_config() -> &'static AgentConfig {
  AGENT_CONFIG
    .get()
    .expect("agent config is initialized at startup")
}

static AGENT_CONFIG: OnceLock<AgentConfig> = OnceLock::new();

/// Loads the configuration file (CLI arg, then environment, then
/// default path), substitutes `${VAR}` tokens, binds the typed
/// schema, applies environment overrides, and validates. Any
/// failure here is fatal at startup.
pub fn init_config() -> anyhow::Result<&'static AgentConfig> {
  let env: Env = envy::from_env()
    .context("Failed to parse Deployment Agent environment")?;
  let args = CliArgs::parse();
  let path = args
    .config_path
    .unwrap_or(env.deployment_agent_config_path);
  println!(
    "{}: {}: {path:?}",
    "INFO".green(),
    "Config Path".dimmed(),
  );

  let mut config: AgentConfig = config::load_yaml_file(&path)
    .map_err(|e| anyhow!("{e}"))
    .context("Failed to load configuration file")?;

  if let Some(base_path) = env.deployment_agent_base_path {
    config.main.base_path = base_path;
  }
  config.logging = LogConfig {
    level: env
      .deployment_agent_log_level
      .unwrap_or(config.main.log_level),
    stdio: env
      .deployment_agent_logging_stdio
      .unwrap_or_default(),
    pretty: env
      .deployment_agent_logging_pretty
      .unwrap_or_default(),
    otlp_endpoint: env
      .deployment_agent_logging_otlp_endpoint
      .unwrap_or_default(),
    ..Default::default()
  };

  config.validate()?;

  AGENT_CONFIG
    .set(config)
    .map_err(|_| anyhow!("Config initialized more than once"))?;
  Ok(agent_config())
}

#[derive(Parser)]
#[command(name = "deployment-agent")]
pub struct CliArgs {
  /// Path to the yaml configuration file.
  #[arg(long)]
  pub config_path: Option<PathBuf>,
}

/// Environment overrides, lowest priority comes from the file.
#[derive(Deserialize)]
pub struct Env {
  #[serde(default = "default_config_path")]
  pub deployment_agent_config_path: PathBuf,
  pub deployment_agent_base_path: Option<PathBuf>,
  pub deployment_agent_log_level: Option<LogLevel>,
  pub deployment_agent_logging_stdio: Option<StdioLogMode>,
  pub deployment_agent_logging_pretty: Option<bool>,
  pub deployment_agent_logging_otlp_endpoint: Option<String>,
}

fn default_config_path() -> PathBuf {
  PathBuf::from("deployment-agent.yaml")
}

const SUPPORTED_CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
  /// Config schema version. Must be "1.0".
  pub version: String,
  pub rest: RestConfig,
  pub main: MainConfig,
  /// Assembled from `main.log_level` and environment overrides.
  #[serde(skip)]
  pub logging: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestConfig {
  /// Api version reported by the health surface.
  pub version: String,
  /// Path to the OpenAPI document served at the health surface.
  pub location: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MainConfig {
  pub log_level: LogLevel,
  pub host: String,
  pub port: u16,
  /// When true, deploys track the highest tag matching each
  /// repo's `tags` pattern instead of the branch tip.
  #[serde(default)]
  pub synced_via_tags: bool,
  pub watched_git_repositories: Vec<WatchedRepo>,
  #[serde(default)]
  pub docker_private_registries: Vec<RegistryConfig>,
  pub docker_stack_recipe: RecipeConfig,
  pub portainer: Vec<PortainerConfig>,
  /// Seconds between cycles, counted from the end of the
  /// previous cycle. Must be >= 1.
  pub polling_interval: u64,
  #[serde(default)]
  pub notifications: Vec<NotificationConfig>,
  /// Root for git working copies and recipe scratch directories.
  #[serde(default = "default_base_path")]
  pub base_path: PathBuf,
  /// Deadline for each outbound http call, in seconds.
  #[serde(default = "default_http_timeout")]
  pub http_timeout: u64,
}

fn default_base_path() -> PathBuf {
  PathBuf::from("/tmp/deployment-agent")
}

fn default_http_timeout() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchedRepo {
  pub id: String,
  pub url: String,
  #[serde(default = "default_branch")]
  pub branch: String,
  #[serde(default)]
  pub username: Option<String>,
  #[serde(default)]
  pub password: Option<String>,
  /// Regex selecting the tags that participate in tag-sync.
  #[serde(default)]
  pub tags: Option<String>,
  /// Path selectors (plain paths or wildcard patterns) whose
  /// content participates in change detection.
  #[serde(default)]
  pub paths: Vec<String>,
}

fn default_branch() -> String {
  String::from("main")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
  /// Registry url including the api version prefix,
  /// eg. `https://registry.example.com/v2`.
  pub url: String,
  #[serde(default)]
  pub username: Option<String>,
  #[serde(default)]
  pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeConfig {
  /// Files staged from repo working copies into the working
  /// directory before the command runs.
  #[serde(default)]
  pub files: Vec<RecipeFiles>,
  pub workdir: Workdir,
  #[serde(default)]
  pub command: Option<String>,
  /// The output stack file, relative to the working directory.
  pub stack_file: String,
  #[serde(default)]
  pub excluded_services: Vec<String>,
  #[serde(default)]
  pub excluded_volumes: Vec<String>,
  /// Overlays deep-merged into every remaining service
  /// (`environment`, `extra_hosts`, arbitrary keys).
  #[serde(default)]
  pub additional_parameters: IndexMap<String, serde_yaml_ng::Value>,
  #[serde(default)]
  pub services_prefix: String,
  /// Deadline for the recipe command, in seconds.
  #[serde(default = "default_command_deadline")]
  pub command_deadline: u64,
}

fn default_command_deadline() -> u64 {
  120
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeFiles {
  /// Source repo id.
  pub id: String,
  /// Paths relative to the repo working copy.
  pub paths: Vec<String>,
}

/// Where the recipe command runs: inside a repo working copy, or
/// in a scratch directory created fresh every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workdir {
  Temporary,
  Repo(String),
}

impl<'de> Deserialize<'de> for Workdir {
  fn deserialize<D>(deserializer: D) -> Result<Workdir, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let raw = String::deserialize(deserializer)?;
    if raw == "temporary" {
      Ok(Workdir::Temporary)
    } else {
      Ok(Workdir::Repo(raw))
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortainerConfig {
  pub url: String,
  /// Negative means: discover the single endpoint.
  #[serde(default = "default_endpoint_id")]
  pub endpoint_id: i64,
  pub username: String,
  pub password: String,
  #[serde(default = "default_stack_name")]
  pub stack_name: String,
}

fn default_endpoint_id() -> i64 {
  -1
}

fn default_stack_name() -> String {
  String::from("deployment-agent")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
  pub service: NotificationService,
  pub url: String,
  /// Message template. `{{version}}` is replaced with the
  /// deployed tag or short commit.
  pub message: String,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  pub channel_id: String,
  pub personal_token: String,
  /// When set, the channel header is patched with
  /// `<header_unique_name>:<version>` after a deploy.
  #[serde(default)]
  pub header_unique_name: Option<String>,
}

fn default_enabled() -> bool {
  true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationService {
  Mattermost,
  /// Unrecognized kinds are skipped with a warning at dispatch.
  #[serde(other)]
  Unknown,
}

impl AgentConfig {
  pub fn validate(&self) -> anyhow::Result<()> {
    if self.version != SUPPORTED_CONFIG_VERSION {
      return Err(anyhow!(
        "Unsupported config version '{}', expected '{SUPPORTED_CONFIG_VERSION}'",
        self.version
      ));
    }
    if self.main.polling_interval < 1 {
      return Err(anyhow!("polling_interval must be >= 1 second"));
    }
    if self.main.portainer.is_empty() {
      return Err(anyhow!(
        "At least one portainer instance must be configured"
      ));
    }
    for repo in &self.main.watched_git_repositories {
      if let Some(pattern) = &repo.tags {
        regex::Regex::new(pattern).with_context(|| {
          format!("Invalid tags pattern for repo '{}'", repo.id)
        })?;
      }
    }
    let repo_ids = self
      .main
      .watched_git_repositories
      .iter()
      .map(|repo| repo.id.as_str())
      .collect::<Vec<_>>();
    for files in &self.main.docker_stack_recipe.files {
      if !repo_ids.contains(&files.id.as_str()) {
        return Err(anyhow!(
          "Recipe references unknown repo '{}'",
          files.id
        ));
      }
    }
    if let Workdir::Repo(id) = &self.main.docker_stack_recipe.workdir
      && !repo_ids.contains(&id.as_str())
    {
      return Err(anyhow!(
        "Recipe workdir references unknown repo '{id}'"
      ));
    }
    if !self.rest.location.exists() {
      return Err(anyhow!(
        "OpenAPI document not found at {:?}",
        self.rest.location
      ));
    }
    Ok(())
  }

  /// A copy safe to print at startup.
  pub fn sanitized(&self) -> AgentConfig {
    let mut config = self.clone();
    for repo in &mut config.main.watched_git_repositories {
      if repo.password.is_some() {
        repo.password = Some(String::from("##############"));
      }
    }
    for registry in &mut config.main.docker_private_registries {
      if registry.password.is_some() {
        registry.password = Some(String::from("##############"));
      }
    }
    for portainer in &mut config.main.portainer {
      portainer.password = String::from("##############");
    }
    for notification in &mut config.main.notifications {
      notification.personal_token = String::from("##############");
    }
    config
  }

  pub fn repos_root(&self) -> PathBuf {
    self.main.base_path.join("repos")
  }

  pub fn work_root(&self) -> PathBuf {
    self.main.base_path.join("work")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  pub fn example_yaml() -> String {
    String::from(
      r#"
version: "1.0"
rest:
  version: v0
  location: /dev/null
main:
  log_level: INFO
  host: 127.0.0.1
  port: 8888
  synced_via_tags: true
  watched_git_repositories:
    - id: services
      url: https://git.example.com/org/services.git
      branch: master
      username: deploy
      password: hunter2
      tags: ^v\d+\.\d+\.\d+$
      paths:
        - services/docker-compose.yml
        - services/*.env
  docker_private_registries:
    - url: https://registry.example.com/v2
      username: puller
      password: hunter2
  docker_stack_recipe:
    files:
      - id: services
        paths:
          - services/docker-compose.yml
    workdir: temporary
    command: cp services/docker-compose.yml stack.yml
    stack_file: stack.yml
    excluded_services: [webclient]
    excluded_volumes: [scratch]
    additional_parameters:
      environment:
        DEPLOYED_BY: agent
      extra_hosts:
        - "registry:10.0.0.2"
    services_prefix: stg
  portainer:
    - url: https://portainer.example.com
      username: admin
      password: hunter2
      endpoint_id: 1
      stack_name: deployment-agent
  polling_interval: 30
  notifications:
    - service: mattermost
      url: https://mattermost.example.com
      message: "Deployed {{version}}"
      enabled: true
      channel_id: abc123
      personal_token: token123
      header_unique_name: staging
"#,
    )
  }

  pub fn example_config() -> AgentConfig {
    serde_yaml_ng::from_str(&example_yaml()).unwrap()
  }

  #[test]
  fn parses_and_validates_example() {
    let config = example_config();
    config.validate().unwrap();
    assert_eq!(
      config.main.docker_stack_recipe.workdir,
      Workdir::Temporary
    );
    assert_eq!(
      config.main.notifications[0].service,
      NotificationService::Mattermost
    );
    assert_eq!(config.main.http_timeout, 30);
  }

  #[test]
  fn unknown_top_level_keys_are_rejected() {
    let yaml = example_yaml()
      .replace("version: \"1.0\"", "version: \"1.0\"\nextra: 1");
    assert!(serde_yaml_ng::from_str::<AgentConfig>(&yaml).is_err());
  }

  #[test]
  fn unsupported_version_fails_validation() {
    let yaml =
      example_yaml().replace("version: \"1.0\"", "version: \"2.0\"");
    let config: AgentConfig =
      serde_yaml_ng::from_str(&yaml).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn zero_polling_interval_fails_validation() {
    let yaml = example_yaml()
      .replace("polling_interval: 30", "polling_interval: 0");
    let config: AgentConfig =
      serde_yaml_ng::from_str(&yaml).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn workdir_repo_variant_must_reference_known_repo() {
    let yaml = example_yaml()
      .replace("workdir: temporary", "workdir: unknown-repo");
    let config: AgentConfig =
      serde_yaml_ng::from_str(&yaml).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("unknown-repo"));
  }

  #[test]
  fn unknown_notification_service_parses_as_unknown() {
    let yaml =
      example_yaml().replace("service: mattermost", "service: irc");
    let config: AgentConfig =
      serde_yaml_ng::from_str(&yaml).unwrap();
    assert_eq!(
      config.main.notifications[0].service,
      NotificationService::Unknown
    );
  }

  #[test]
  fn sanitized_hides_secrets() {
    let config = example_config().sanitized();
    assert_eq!(
      config.main.portainer[0].password.as_str(),
      "##############"
    );
    assert_eq!(
      config.main.watched_git_repositories[0]
        .password
        .as_deref(),
      Some("##############")
    );
  }
}
