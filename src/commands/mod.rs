pub mod check_config;
pub mod filter;
pub mod run;

pub use check_config::handle_check_config;
pub use filter::handle_filter;
pub use run::handle_run;
