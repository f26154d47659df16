use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "fence")]
#[command(version)]
#[command(about = "Run commands inside a policy-driven sandbox")]
#[command(after_help = "\
Examples:
  fence -- npm install                 run under the default policy
  fence --settings team.json -- make   use an explicit policy file
  fence -t strict -c 'curl example.com'  template policy, script string
  fence -p 3000 -- npm run dev         expose an inbound port")]
pub struct Cli {
    /// Path to a policy file (default: the platform config location)
    #[arg(long, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Base the policy on a named template from the template catalog
    #[arg(short = 't', long, value_name = "NAME")]
    pub template: Option<String>,

    /// Print the composed launcher argv and per-request verdicts
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Suppress debug output but print every violation record
    #[arg(short = 'm', long)]
    pub monitor: bool,

    /// Expose an inbound port into the sandbox (repeatable)
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub ports: Vec<u16>,

    /// Run a script string instead of a positional command
    #[arg(short = 'c', long = "command", value_name = "SCRIPT")]
    pub script: Option<String>,

    /// Print available Linux sandbox features and exit
    #[arg(long)]
    pub linux_features: bool,

    /// Print the policy JSON schema and exit
    #[arg(long)]
    pub schema: bool,

    /// Internal re-exec hook: apply Landlock, then exec the command
    #[arg(long, hide = true)]
    pub landlock_apply: bool,

    /// The command to run inside the sandbox
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}
