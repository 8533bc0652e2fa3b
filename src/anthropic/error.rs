//! Tipos de erro para o cliente da API Anthropic.
//!
//! Qualquer variante de [`AnthropicError`] é tratada pelo gate de qualidade
//! como uma tentativa falha; nenhuma delas interrompe o pipeline sozinha.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// A chamada excedeu o timeout configurado no cliente.
    #[error("request timed out")]
    Timeout,

    /// Falha de rede subjacente (DNS, conexão recusada, corpo inválido).
    #[error("network error: {0}")]
    NetworkError(reqwest::Error),
}

impl From<reqwest::Error> for AnthropicError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnthropicError::Timeout
        } else {
            AnthropicError::NetworkError(err)
        }
    }
}
