use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "graphbridged", version, about = "graphbridge batched inference daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Built-in reference engine (`model.json` graphs)
    Ref,
    /// ONNX Runtime (`model.onnx`)
    Onnx,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a model repository and drive synthetic requests through it
    Run {
        /// Model repository holding config.json and <version>/<model file>
        #[arg(long, default_value = "models/doubler")]
        model_repo: PathBuf,

        /// Engine executing the model
        #[arg(long, value_enum, default_value_t = EngineKind::Ref)]
        engine: EngineKind,

        /// Number of synthetic requests to send
        #[arg(long, default_value_t = 32)]
        requests: u64,

        /// Batch rows per request, for models that batch
        #[arg(long, default_value_t = 1)]
        rows: usize,

        /// Batching window delay in milliseconds
        #[arg(long, default_value_t = 5)]
        max_delay_ms: u64,

        /// Log filter (RUST_LOG syntax)
        #[arg(long, default_value = "info")]
        log: String,
    },
}
