//! Configuração do novelsmith carregada a partir de `novelsmith.toml`.
//!
//! A struct [`AppConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `NOVELSMITH_API_KEY` e `ANTHROPIC_API_KEY`
//! preenchem a chave de todo perfil que não tenha uma.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::gate::{RetryPolicy, Thresholds};
use crate::pipeline::PipelineSettings;

/// Arquivo lido quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "novelsmith.toml";

/// Endpoint Messages usado por perfis sem `api_base`.
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1/messages";

/// Modelo usado pelo perfil implícito.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Configuração de nível superior carregada de `novelsmith.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Diretório do armazenamento de jobs.
    pub store_dir: PathBuf,

    /// Diretório onde `export` grava os textos finais.
    pub export_dir: PathBuf,

    /// Tentativas e backoff de cada gate de qualidade.
    pub retry: RetryPolicy,

    /// Nota mínima por fase.
    pub thresholds: Thresholds,

    /// Idade máxima do heartbeat antes de um lease ser considerado abandonado.
    pub lease_ttl_secs: u64,

    /// Timeout de cada chamada ao oráculo.
    pub oracle_timeout_secs: u64,

    /// Credenciais e modelos disponíveis.
    pub profiles: Vec<OracleProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("novelsmith-data"),
            export_dir: PathBuf::from("exports"),
            retry: RetryPolicy::default(),
            thresholds: Thresholds::default(),
            lease_ttl_secs: 1800,
            oracle_timeout_secs: 120,
            profiles: Vec::new(),
        }
    }
}

/// Para que um perfil pode ser usado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileRole {
    Generation,
    Check,
    Both,
}

/// O uso pedido ao resolver um perfil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OraclePurpose {
    Generation,
    Check,
}

/// Um conjunto de credenciais e modelo do oráculo.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OracleProfile {
    pub name: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_role")]
    pub role: ProfileRole,
    #[serde(default = "default_active")]
    pub active: bool,
}

// Valor padrão para o endpoint: a API Messages da Anthropic.
fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

// Valor padrão para o modelo.
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

// Um perfil sem papel serve para geração e verificação.
fn default_role() -> ProfileRole {
    ProfileRole::Both
}

fn default_active() -> bool {
    true
}

/// Escolhe o perfil para `purpose`.
///
/// Ordem de preferência entre perfis ativos: papel exato, depois `both`,
/// depois qualquer um. Retorna `None` se nenhum perfil estiver ativo.
pub fn resolve_profile(profiles: &[OracleProfile], purpose: OraclePurpose) -> Option<&OracleProfile> {
    let exact = match purpose {
        OraclePurpose::Generation => ProfileRole::Generation,
        OraclePurpose::Check => ProfileRole::Check,
    };
    let active = || profiles.iter().filter(|p| p.active);
    active()
        .find(|p| p.role == exact)
        .or_else(|| active().find(|p| p.role == ProfileRole::Both))
        .or_else(|| active().next())
}

impl AppConfig {
    /// Carrega a configuração de `path`, ou de `novelsmith.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&contents).with_context(|| format!("invalid config in {}", path.display()))?
        } else {
            Self::default()
        };

        let key = ["NOVELSMITH_API_KEY", "ANTHROPIC_API_KEY"]
            .into_iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|key| !key.is_empty());
        if let Some(key) = key {
            config.apply_env_key(&key);
        }

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Preenche a chave dos perfis que não têm uma. Sem perfis, cria um
    /// perfil implícito com os valores padrão.
    pub fn apply_env_key(&mut self, key: &str) {
        if self.profiles.is_empty() {
            self.profiles.push(OracleProfile {
                name: "env".into(),
                api_base: default_api_base(),
                api_key: String::new(),
                model: default_model(),
                role: ProfileRole::Both,
                active: true,
            });
        }
        for profile in &mut self.profiles {
            if profile.api_key.is_empty() {
                profile.api_key = key.to_string();
            }
        }
    }

    /// Perfil resolvido para `purpose`, com erro explicativo se faltar.
    pub fn profile_for(&self, purpose: OraclePurpose) -> Result<&OracleProfile> {
        let profile = resolve_profile(&self.profiles, purpose).with_context(|| {
            format!("no active oracle profile for {purpose:?}; add one to {DEFAULT_CONFIG_FILE} or set ANTHROPIC_API_KEY")
        })?;
        anyhow::ensure!(
            !profile.api_key.is_empty(),
            "oracle profile {:?} has no API key",
            profile.name
        );
        Ok(profile)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry: self.retry,
            thresholds: self.thresholds,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
        }
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, role: ProfileRole, active: bool) -> OracleProfile {
        OracleProfile {
            name: name.into(),
            api_base: default_api_base(),
            api_key: "k".into(),
            model: default_model(),
            role,
            active,
        }
    }

    #[test]
    fn default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.store_dir, PathBuf::from("novelsmith-data"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.thresholds.sub_outline, 32.0);
        assert_eq!(config.lease_ttl_secs, 1800);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            store_dir = "/tmp/jobs"

            [retry]
            max_attempts = 5

            [thresholds]
            content = 45

            [[profiles]]
            name = "writer"
            api_key = "sk-test-123"
            role = "generation"
            "#,
        )
        .unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/tmp/jobs"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.thresholds.content, 45.0);
        assert_eq!(config.thresholds.setup, 40.0);
        assert_eq!(config.profiles[0].model, DEFAULT_MODEL);
        assert!(config.profiles[0].active);
    }

    #[test]
    fn profile_resolution_order() {
        let profiles = vec![
            profile("both", ProfileRole::Both, true),
            profile("judge-off", ProfileRole::Check, false),
            profile("writer", ProfileRole::Generation, true),
        ];
        assert_eq!(resolve_profile(&profiles, OraclePurpose::Generation).unwrap().name, "writer");
        assert_eq!(resolve_profile(&profiles, OraclePurpose::Check).unwrap().name, "both");

        let only_writer = vec![profile("writer", ProfileRole::Generation, true)];
        assert_eq!(resolve_profile(&only_writer, OraclePurpose::Check).unwrap().name, "writer");

        let none_active = vec![profile("off", ProfileRole::Both, false)];
        assert!(resolve_profile(&none_active, OraclePurpose::Generation).is_none());
    }

    #[test]
    fn env_key_fills_missing_keys_only() {
        let mut config = AppConfig::default();
        config.apply_env_key("from-env");
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].api_key, "from-env");

        let mut config = AppConfig::default();
        config.profiles = vec![profile("set", ProfileRole::Both, true)];
        config.profiles.push(OracleProfile {
            api_key: String::new(),
            ..profile("unset", ProfileRole::Check, true)
        });
        config.apply_env_key("from-env");
        assert_eq!(config.profiles[0].api_key, "k");
        assert_eq!(config.profiles[1].api_key, "from-env");
    }

    #[test]
    fn missing_key_is_an_error() {
        let config = AppConfig::default();
        assert!(config.profile_for(OraclePurpose::Generation).is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let config = AppConfig::load(Some(Path::new("does-not-exist.toml"))).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }
}
