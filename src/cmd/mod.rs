//! CLI command implementations.
//!
//! | Module     | Commands handled       |
//! |------------|------------------------|
//! | `serve`    | `Serve`                |
//! | `project`  | `Init`                 |
//! | `config`   | `Config`               |
//! | `manifest` | `Manifest`             |

pub mod config;
pub mod manifest;
pub mod project;
pub mod serve;

pub use config::cmd_config;
pub use manifest::cmd_manifest;
pub use project::cmd_init;
pub use serve::{ServeOverrides, cmd_serve};
