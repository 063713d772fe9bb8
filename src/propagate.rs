//! Process propagation
//!
//! Children of a virtualized process join the same instance: the
//! parent serializes its call parameters into the child's environment
//! and preloads the hook library, the child attaches from that
//! environment before its main runs, registers itself, and
//! unregisters on exit. Blacklisted executables are created without
//! any of this.
//!
//! A process moves through: unattached, attached (user count up),
//! registered, then back out through unregister and detach.

use crate::config::{InstanceConfig, PARAMS_ENV};
use crate::context::HookContext;
use crate::error::Result;
use std::path::Path;
use std::process::{Child, Command};
use tracing::{debug, info, warn};

/// Preload variable of the host loader
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Everything decided about a child before it is spawned
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Whether the child joins the instance
    pub inject: bool,
    /// Environment handed to the child
    pub env: Vec<(String, String)>,
    /// Libraries forced into this executable, newest registration
    /// first
    pub forced_libraries: Vec<String>,
}

/// Spawns children into (or deliberately out of) the parent's instance
pub struct ChildLauncher<'a> {
    ctx: &'a HookContext,
}

impl<'a> ChildLauncher<'a> {
    pub fn new(ctx: &'a HookContext) -> Self {
        ChildLauncher { ctx }
    }

    /// Decide how a child would be created, without creating it
    pub fn plan(&self, program: &Path, command_line: Option<&str>) -> Result<LaunchPlan> {
        let guard = self.ctx.read_access()?;

        let app_name = program.to_string_lossy();
        if guard.executable_blacklisted(Some(&app_name), command_line) {
            info!(program = %app_name, "blacklisted, child will not be virtualized");
            return Ok(LaunchPlan {
                inject: false,
                env: Vec::new(),
                forced_libraries: Vec::new(),
            });
        }

        let parameters = guard.call_parameters();
        let hook_library = match &parameters.hook_library {
            Some(library) => library.clone(),
            None => {
                // Injection failure policy: the child runs
                // unvirtualized and we say so.
                warn!(
                    program = %app_name,
                    "no hook library configured, child will run unvirtualized"
                );
                return Ok(LaunchPlan {
                    inject: false,
                    env: Vec::new(),
                    forced_libraries: Vec::new(),
                });
            }
        };

        let process_name = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| app_name.into_owned());
        let forced_libraries = guard.libraries_to_force_load(&process_name);

        let mut preload: Vec<String> = vec![hook_library.to_string_lossy().into_owned()];
        preload.extend(forced_libraries.iter().cloned());

        let env = vec![
            (PARAMS_ENV.to_string(), parameters.to_env_payload()?),
            (PRELOAD_ENV.to_string(), preload.join(":")),
        ];

        Ok(LaunchPlan {
            inject: true,
            env,
            forced_libraries,
        })
    }

    /// Create the child. Virtualized children are registered in the
    /// instance process list before this returns.
    pub fn launch(&self, program: &Path, args: &[String]) -> Result<Child> {
        let command_line = std::iter::once(program.to_string_lossy().into_owned())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let plan = self.plan(program, Some(&command_line))?;

        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in &plan.env {
            command.env(key, value);
        }

        let child = command.spawn()?;

        if plan.inject {
            let guard = self.ctx.write_access()?;
            guard.register_process(child.id())?;
            debug!(
                program = %program.display(),
                pid = child.id(),
                forced = plan.forced_libraries.len(),
                "virtualized child created"
            );
        }

        Ok(child)
    }

    /// Drop a terminated child from the instance process list
    pub fn reap(&self, pid: u32) -> Result<bool> {
        let guard = self.ctx.write_access()?;
        Ok(guard.unregister_process(pid))
    }
}

/// Child-side bootstrap: attach to the instance the parent serialized
/// into our environment, if any, and register this process
pub fn attach_from_env() -> Result<Option<HookContext>> {
    let config = match InstanceConfig::from_env()? {
        Some(config) => config,
        None => return Ok(None),
    };

    let ctx = HookContext::attach(&config)?;
    {
        let guard = ctx.write_access()?;
        guard.register_process(std::process::id())?;
    }
    info!(instance = %config.instance_name, "attached from parent environment");
    Ok(Some(ctx))
}

/// Process-exit path: settle outstanding results and leave the
/// instance process list. Detach itself happens when the context
/// drops.
pub fn on_process_exit(ctx: &HookContext) {
    for pending in ctx.drain_delayed() {
        let _ = pending.join();
    }

    match ctx.write_access() {
        Ok(guard) => {
            guard.unregister_current_process();
        }
        Err(e) => {
            warn!(error = %e, "could not unregister on exit");
        }
    }
}
