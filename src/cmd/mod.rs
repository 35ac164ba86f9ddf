//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled          |
//! |-------------|---------------------------|
//! | `project`   | `Init`                    |
//! | `run`       | `Start`, `Run`, `Abort`   |
//! | `status`    | `Status`, `List`          |
//! | `compare`   | `Compare`                 |
//! | `workspace` | `Promote`, `Destroy`      |

pub mod compare;
pub mod project;
pub mod run;
pub mod status;
pub mod workspace;

pub use compare::cmd_compare;
pub use project::cmd_init;
pub use run::{cmd_abort, cmd_run, cmd_start};
pub use status::{cmd_list, cmd_status};
pub use workspace::{cmd_destroy, cmd_promote};
