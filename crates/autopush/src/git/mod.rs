//! Git operations for the synchronization engine.

pub mod parse;
pub mod working_copy;

pub use parse::{format_git_error, parse_ls_remote, pick_semver_tag, RemoteRef};
pub use working_copy::{
    clone_args, push_option_args, CheckedOutCommit, CheckoutStrategy, CloneOptions, WorkingCopy,
};
