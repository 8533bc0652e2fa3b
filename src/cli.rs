//! Interface de linha de comando do novelsmith baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] e flags globais
//! (--config, --store, --max-attempts, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// novelsmith: geração de textos longos em etapas, com gates de qualidade
/// e execução retomável.
#[derive(Debug, Parser)]
#[command(name = "novelsmith", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./novelsmith.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Diretório do armazenamento de jobs; sobrepõe `store_dir`.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Número máximo de tentativas por gate; sobrepõe `[retry].max_attempts`.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria um job pendente e imprime seu id.
    Create {
        /// Título de trabalho do documento.
        #[arg(long, default_value = "Untitled novel")]
        title: String,

        /// Tema central.
        #[arg(long)]
        theme: String,

        /// Ambientação ou contexto da história.
        #[arg(long, default_value = "")]
        background: String,

        /// Tamanho alvo do documento inteiro, em caracteres.
        #[arg(long, default_value_t = 30_000)]
        length: u32,

        /// Número alvo de capítulos.
        #[arg(long, default_value_t = 10)]
        units: u32,

        /// Inicia a execução logo após criar.
        #[arg(long, default_value_t = false)]
        start: bool,
    },

    /// Executa um job pendente até concluir, falhar ou pausar.
    Start { job_id: String },

    /// Retoma um job pausado (ou abandonado por um processo que morreu).
    Resume { job_id: String },

    /// Pede que a execução pare no próximo ponto seguro.
    Pause { job_id: String },

    /// Mostra status, etapa e progresso de um job.
    Status {
        job_id: String,

        /// Imprime o relatório em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Lista os capítulos de um job.
    Units { job_id: String },

    /// Mostra o log de geração de um job.
    Logs {
        job_id: String,

        /// Mostra apenas as N entradas mais recentes.
        #[arg(long)]
        tail: Option<usize>,
    },

    /// Exporta um job concluído como texto puro.
    Export {
        job_id: String,

        /// Diretório de saída; sobrepõe `export_dir`.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Mostra cada chamada ao oráculo feita por um job: tokens, custo e duração.
    Usage { job_id: String },

    /// Lista todos os jobs, mais recentes primeiro.
    List,

    /// Conta os jobs armazenados por status.
    Stats {
        /// Imprime as contagens em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Remove um job, seus capítulos e seu log.
    Delete { job_id: String },
}
