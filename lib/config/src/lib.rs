//! # Deployment Agent Config
//!
//! Loads a YAML configuration file into a typed schema.
//! Any `${VAR}` token in the file is substituted from the process
//! environment before parsing; a reference to an unset variable is
//! an error, so a misconfigured deployment fails at startup rather
//! than deploying with an empty credential.

use std::{path::Path, sync::OnceLock};

use regex::Regex;
use serde::de::DeserializeOwned;

mod error;

pub use error::Error;

pub type Result<T> = ::core::result::Result<T, Error>;

pub fn load_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
  let contents = std::fs::read_to_string(path).map_err(|e| {
    Error::ReadFileContents {
      e,
      path: path.to_path_buf(),
    }
  })?;
  let contents = substitute_env(&contents)?;
  serde_yaml_ng::from_str(&contents).map_err(|e| Error::ParseYaml {
    e,
    path: path.to_path_buf(),
  })
}

/// Only supports '${VAR}' syntax.
/// Runs a second pass in case a variable expands to another variable.
pub fn substitute_env(input: &str) -> Result<String> {
  let out = substitute_env_pass(input)?;
  if out.contains("${") {
    substitute_env_pass(&out)
  } else {
    Ok(out)
  }
}

fn env_token() -> &'static Regex {
  static ENV_TOKEN: OnceLock<Regex> = OnceLock::new();
  ENV_TOKEN.get_or_init(|| {
    Regex::new(r"\$\{([A-Za-z0-9_]+)\}")
      .expect("invalid env token regex")
  })
}

fn substitute_env_pass(input: &str) -> Result<String> {
  let mut out = String::with_capacity(input.len());
  let mut last = 0;
  for caps in env_token().captures_iter(input) {
    let token = caps.get(0).expect("capture 0 always present");
    let name = &caps[1];
    let value = std::env::var(name).map_err(|_| {
      Error::MissingEnvVar {
        name: name.to_string(),
      }
    })?;
    out.push_str(&input[last..token.start()]);
    out.push_str(&value);
    last = token.end();
  }
  out.push_str(&input[last..]);
  Ok(out)
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use serde::Deserialize;

  use super::*;

  #[test]
  fn substitutes_env_vars() {
    unsafe { std::env::set_var("CONFIG_TEST_USER", "svc-deploy") };
    let out =
      substitute_env("user: ${CONFIG_TEST_USER}\nport: 8888")
        .unwrap();
    assert_eq!(out, "user: svc-deploy\nport: 8888");
  }

  #[test]
  fn missing_env_var_is_fatal() {
    let err =
      substitute_env("password: ${CONFIG_TEST_DEFINITELY_UNSET}")
        .unwrap_err();
    assert!(matches!(err, Error::MissingEnvVar { name } if name == "CONFIG_TEST_DEFINITELY_UNSET"));
  }

  #[test]
  fn loads_typed_yaml() {
    #[derive(Deserialize)]
    struct Cfg {
      version: String,
      port: u16,
    }
    unsafe { std::env::set_var("CONFIG_TEST_PORT", "8888") };
    let mut file = tempfile::Builder::new()
      .suffix(".yaml")
      .tempfile()
      .unwrap();
    write!(file, "version: \"1.0\"\nport: ${{CONFIG_TEST_PORT}}")
      .unwrap();
    let cfg: Cfg = load_yaml_file(file.path()).unwrap();
    assert_eq!(cfg.version, "1.0");
    assert_eq!(cfg.port, 8888);
  }

  #[test]
  fn duplicate_yaml_keys_are_rejected() {
    #[derive(Deserialize)]
    struct Cfg {
      #[allow(dead_code)]
      port: u16,
    }
    let mut file = tempfile::Builder::new()
      .suffix(".yaml")
      .tempfile()
      .unwrap();
    write!(file, "port: 1\nport: 2").unwrap();
    assert!(load_yaml_file::<Cfg>(file.path()).is_err());
  }
}
