pub mod init;
pub mod run;
pub mod scan;
pub mod status;
pub mod version;

pub use init::Init;
pub use run::Run;
pub use scan::Scan;
pub use status::Status;
pub use version::Version;
