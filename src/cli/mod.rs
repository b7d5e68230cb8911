//! CLI argument parsing for statelock.
//!
//! Uses clap derive macros for declarative argument definitions.
//! This module defines the command structure; actual implementations
//! are in the `commands` module.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Statelock: run Terraform under a distributed lock on its state file.
///
/// `apply` and `destroy` acquire the lock named in `.statelock.yaml`, run
/// Terraform while heartbeating it, and release it afterwards. Any other
/// subcommand is passed straight to Terraform without locking.
#[derive(Parser, Debug)]
#[command(name = "statelock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the config file (default: ./.statelock.yaml).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). STATELOCK_LOG overrides.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands for statelock.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Acquire the lock and run `terraform apply`.
    ///
    /// Every argument after `apply`, including `--help`, goes to Terraform.
    #[command(disable_help_flag = true, disable_version_flag = true)]
    Apply(TerraformArgs),

    /// Acquire the lock and run `terraform destroy`.
    #[command(disable_help_flag = true, disable_version_flag = true)]
    Destroy(TerraformArgs),

    /// Forcibly delete the lock record, whoever holds it.
    ///
    /// Shows the current holder and asks for confirmation. Use this to clear
    /// a lock left behind by a crashed process.
    ReleaseLock(ReleaseLockArgs),

    /// Show who holds the lock, for how long, and whether it is stale.
    Status,

    /// Any other subcommand is forwarded to Terraform without locking.
    #[command(external_subcommand)]
    Other(Vec<String>),
}

/// Arguments passed through to Terraform.
#[derive(Args, Debug)]
pub struct TerraformArgs {
    /// Extra arguments for Terraform (e.g. -auto-approve).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Arguments for the `release-lock` command.
#[derive(Args, Debug)]
pub struct ReleaseLockArgs {
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    pub yes: bool,
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_debug_assert() {
        // Verifies the CLI arguments configuration is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_apply_with_passthrough_args() {
        let cli = Cli::try_parse_from([
            "statelock",
            "apply",
            "-auto-approve",
            "-var",
            "region=eu-west-1",
        ])
        .unwrap();
        if let Command::Apply(args) = cli.command {
            assert_eq!(args.args, vec!["-auto-approve", "-var", "region=eu-west-1"]);
        } else {
            panic!("Expected Apply command");
        }
    }

    #[test]
    fn terraform_flags_are_not_parsed_as_ours() {
        let cli =
            Cli::try_parse_from(["statelock", "apply", "-refresh-only", "-h", "--help", "-v"])
                .unwrap();
        if let Command::Apply(args) = cli.command {
            assert_eq!(args.args, vec!["-refresh-only", "-h", "--help", "-v"]);
        } else {
            panic!("Expected Apply command");
        }
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parse_destroy_without_args() {
        let cli = Cli::try_parse_from(["statelock", "destroy"]).unwrap();
        if let Command::Destroy(args) = cli.command {
            assert!(args.args.is_empty());
        } else {
            panic!("Expected Destroy command");
        }
    }

    #[test]
    fn parse_release_lock() {
        let cli = Cli::try_parse_from(["statelock", "release-lock"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::ReleaseLock(ReleaseLockArgs { yes: false })
        ));

        let cli = Cli::try_parse_from(["statelock", "release-lock", "--yes"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::ReleaseLock(ReleaseLockArgs { yes: true })
        ));
    }

    #[test]
    fn parse_status() {
        let cli = Cli::try_parse_from(["statelock", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn unknown_subcommand_is_forwarded() {
        let cli = Cli::try_parse_from(["statelock", "plan", "-out=tfplan"]).unwrap();
        if let Command::Other(args) = cli.command {
            assert_eq!(args, vec!["plan", "-out=tfplan"]);
        } else {
            panic!("Expected Other command");
        }
    }

    #[test]
    fn parse_global_options() {
        let cli = Cli::try_parse_from([
            "statelock",
            "-vv",
            "status",
            "--config",
            "infra/lock.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("infra/lock.yaml")));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["statelock"]).is_err());
    }
}
