pub mod analyze_cmd;
pub mod build_cmd;
pub mod inspect_cmd;
pub mod lookup_cmd;
pub mod watch_cmd;

pub use analyze_cmd::cmd_analyze;
pub use build_cmd::cmd_build;
pub use inspect_cmd::cmd_inspect;
pub use lookup_cmd::cmd_lookup;
pub use watch_cmd::cmd_watch;
