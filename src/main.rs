use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};

use fence::cli::Cli;
use fence::config::{Config, ExtendsRef, default_config_paths, merge, resolve_extends, schema, template_path};
use fence::errors::{FenceError, display_error};
use fence::manager::{ManagerOptions, SandboxManager};
use fence::tracing_init::init_tracing;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let debug = cli.debug;
    match run(cli) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            display_error(&err, debug);
            let code = err
                .downcast_ref::<FenceError>()
                .map(FenceError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code.clamp(0, 255) as u8)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    if cli.schema {
        println!("{}", serde_json::to_string_pretty(&schema::generate())?);
        return Ok(0);
    }

    if cli.landlock_apply {
        return landlock_apply(&cli.command);
    }

    if cli.linux_features {
        return linux_features();
    }

    let config = load_config(&cli)?;
    let command = match (&cli.script, cli.command.is_empty()) {
        (Some(script), _) => script.clone(),
        (None, false) => cli.command.join(" "),
        (None, true) => bail!("no command given; pass one after `--` or via -c"),
    };

    let mut manager = SandboxManager::initialize(
        config,
        ManagerOptions {
            debug: cli.debug,
            monitor: cli.monitor,
        },
    )
    .context("failed to initialize sandbox")?;
    manager
        .set_exposed_ports(&cli.ports)
        .context("failed to expose inbound ports")?;

    let wrapped = match manager.wrap_command(&command) {
        Ok(wrapped) => wrapped,
        Err(e) => {
            manager.cleanup();
            return Err(e.into());
        }
    };

    info!(command = %command, "launching sandboxed command");
    let code = execute_child(&wrapped, &manager, cli.monitor)?;

    let violations = manager.violations().snapshot();
    manager.cleanup();
    if cli.monitor && !violations.is_empty() {
        eprintln!("{} violation(s) recorded", violations.len());
    }

    Ok(code)
}

/// Run the wrapped invocation via bash and forward the child's exit code
/// verbatim (128+signal for signal deaths).
fn execute_child(wrapped: &str, manager: &SandboxManager, monitor: bool) -> Result<i32> {
    let mut child = std::process::Command::new("bash")
        .arg("-c")
        .arg(wrapped)
        .spawn()
        .context("failed to spawn sandboxed child")?;

    #[cfg(target_os = "linux")]
    let mut syscall_monitor = if monitor && manager.features().has_ebpf() {
        match fence::sandbox::monitor::EbpfMonitor::start(child.id(), manager.violations()) {
            Ok(m) => Some(m),
            Err(e) => {
                debug!(error = %e, "eBPF monitor unavailable");
                None
            }
        }
    } else {
        None
    };
    #[cfg(not(target_os = "linux"))]
    let _ = (manager, monitor);

    let status = child.wait().context("failed to wait for sandboxed child")?;

    #[cfg(target_os = "linux")]
    if let Some(ref mut m) = syscall_monitor {
        m.stop();
    }

    let code = status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|s| 128 + s).unwrap_or(1)
        }
        #[cfg(not(unix))]
        1
    });
    debug!(code, "sandboxed child exited");
    Ok(code)
}

#[cfg(target_os = "linux")]
fn landlock_apply(command: &[String]) -> Result<i32> {
    // Never returns on success; the process becomes the user command.
    match fence::sandbox::landlock_apply::apply_and_exec(command) {
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(target_os = "linux"))]
fn landlock_apply(_command: &[String]) -> Result<i32> {
    bail!("--landlock-apply is only available on Linux");
}

#[cfg(target_os = "linux")]
fn linux_features() -> Result<i32> {
    fence::sandbox::features::print_features();
    Ok(0)
}

#[cfg(not(target_os = "linux"))]
fn linux_features() -> Result<i32> {
    bail!("--linux-features is only available on Linux");
}

/// Resolve the effective policy: template base (if any), user policy over
/// it, extends chains resolved through the file/template resolver.
fn load_config(cli: &Cli) -> Result<Config> {
    let user = if let Some(path) = &cli.settings {
        Config::load(path)?
    } else {
        load_default_config()?
    };

    let combined = match &cli.template {
        Some(name) => {
            let template = resolve_reference(&ExtendsRef::Template(name.clone()))?;
            merge(&template, &user)
        }
        None => user,
    };

    let resolved = resolve_extends(combined, &mut |reference| resolve_reference(reference))?;
    Ok(resolved)
}

fn load_default_config() -> Result<Config> {
    for path in default_config_paths() {
        if path.exists() {
            debug!(path = %path.display(), "using default policy file");
            return Ok(Config::load(&path)?);
        }
    }
    debug!("no policy file found; using empty policy");
    Ok(Config::default())
}

fn resolve_reference(reference: &ExtendsRef) -> Result<Config, FenceError> {
    match reference {
        ExtendsRef::Template(name) => {
            let path = template_path(name).ok_or_else(|| {
                FenceError::PolicyInvalid(format!("cannot locate template catalog for '{name}'"))
            })?;
            if !path.exists() {
                return Err(FenceError::PolicyInvalid(format!(
                    "unknown template '{name}' (looked in {})",
                    path.display()
                )));
            }
            Config::load_lenient(&path)
        }
        ExtendsRef::Path(raw) => Config::load_lenient(Path::new(raw)),
    }
}
