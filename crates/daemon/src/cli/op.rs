use std::error::Error;
use std::fmt::Display;
use std::path::PathBuf;

/// What every command gets to work with
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    /// State directory override (defaults to ~/.cumulus)
    pub config_path: Option<PathBuf>,
}

impl OpContext {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }
}

/// One CLI command. The output is printed on success.
#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: Error + Send + Sync + 'static;
    type Output: Display;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

/// Builds the `Command` subcommand enum from `(Variant, OpType)` pairs,
/// along with matching `OpOutput`/`OpError` enums and an `Op` impl that
/// dispatches to the selected command.
#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $type:ty)),* $(,)?) => {
        #[derive(Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($type),)*
        }

        impl Command {
            pub fn name(&self) -> &'static str {
                match self {
                    $(Command::$variant(_) => stringify!($variant),)*
                }
            }
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$type as $crate::cli::op::Op>::Output),)*
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(OpOutput::$variant(out) => out.fmt(f),)*
                }
            }
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$type as $crate::cli::op::Op>::Error),
            )*
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Output = OpOutput;
            type Error = OpError;

            async fn execute(&self, ctx: &$crate::cli::op::OpContext) -> Result<OpOutput, OpError> {
                match self {
                    $(
                        Command::$variant(op) => match op.execute(ctx).await {
                            Ok(out) => Ok(OpOutput::$variant(out)),
                            Err(e) => Err(OpError::$variant(e)),
                        },
                    )*
                }
            }
        }
    };
}
