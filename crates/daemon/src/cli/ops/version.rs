use std::convert::Infallible;

use clap::Args;

use cumulus_daemon::version::build_info;

/// Print build information
#[derive(Args, Debug, Clone)]
pub struct Version {
    /// Only the package version
    #[arg(long)]
    pub short: bool,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Version {
    type Error = Infallible;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let build = build_info();
        if self.short {
            return Ok(build.version.to_string());
        }
        Ok(build.to_string())
    }
}
