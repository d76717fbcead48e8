//! Remote-hands agent
//!
//! Runs inside the target process. Two local channels are opened, named
//! after the process id: the command channel, where a controller sends
//! memory and call requests, and the data channel, over which trampolines
//! created on the controller's behalf call back into it.
//!
//! # Safety
//! The library is meant to be loaded into arbitrary processes. Windows
//! `DllMain` returns immediately and does its work on a spawned thread; on
//! Unix the same happens from a load-time constructor when the `autostart`
//! feature is enabled.

pub mod bridge;
pub mod command;
pub mod console;
pub mod context;
pub mod data;
pub mod dispatch;
pub mod functions;

pub use bridge::{DataSession, InboundBridge};
pub use context::AgentContext;
pub use functions::FunctionRegistry;

use hands_common::{init_agent_logging, init_logging, AgentConfig, Result};
use hands_core::{connect, Channel, ChannelName, LocalChannel};
use parking_lot::Mutex;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Agent started by the load-time entry points.
static RUNNING_AGENT: Mutex<Option<AgentHandle>> = Mutex::new(None);

pub struct Agent {
    context: Arc<AgentContext>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            context: Arc::new(AgentContext::new(config)),
        }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    /// Open both channels and spawn the service threads.
    pub fn start(self) -> Result<AgentHandle> {
        let channel_config = &self.context.config.channel;
        let command = Arc::new(LocalChannel::listen(ChannelName::for_current_process(
            channel_config.command_prefix.clone(),
            channel_config.socket_dir.clone(),
        ))?);
        let data = Arc::new(LocalChannel::listen(ChannelName::for_current_process(
            channel_config.data_prefix.clone(),
            channel_config.socket_dir.clone(),
        ))?);
        let shutdown = Arc::new(AtomicBool::new(false));

        let command_thread = {
            let (ctx, channel, shutdown) = (self.context.clone(), command.clone(), shutdown.clone());
            thread::Builder::new()
                .name("hands-command".into())
                .spawn(move || command::run(&ctx, channel.as_ref(), &shutdown))?
        };
        let data_thread = {
            let (ctx, channel, shutdown) = (self.context.clone(), data.clone(), shutdown.clone());
            thread::Builder::new()
                .name("hands-data".into())
                .spawn(move || data::run(&ctx, channel.as_ref(), &shutdown))?
        };

        info!(
            target: "hands_agent",
            command_channel = %command.name(),
            data_channel = %data.name(),
            "Agent started"
        );

        Ok(AgentHandle {
            context: self.context,
            command,
            data,
            shutdown,
            threads: vec![command_thread, data_thread],
        })
    }
}

/// A running agent.
pub struct AgentHandle {
    context: Arc<AgentContext>,
    command: Arc<LocalChannel>,
    data: Arc<LocalChannel>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn command_channel(&self) -> &ChannelName {
        self.command.name()
    }

    pub fn data_channel(&self) -> &ChannelName {
        self.data.name()
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    /// Ask the services to stop without waiting for them.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop both services, drop any connected controller, and wait for the
    /// threads to exit. The channel endpoints are removed.
    pub fn shutdown(mut self) {
        self.request_shutdown();

        for channel in [&self.command, &self.data] {
            let _ = channel.disconnect();
            // Wakes a service blocked in accept.
            if let Err(e) = connect(channel.name()) {
                debug!(target: "hands_agent", channel = %channel.name(), error = %e, "Wake-up connect failed");
            }
        }

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!(target: "hands_agent", "Service thread panicked");
            }
        }

        let _ = self.command.close();
        let _ = self.data.close();
        info!(target: "hands_agent", "Agent stopped");
    }
}

/// Log panics instead of letting them vanish with a thread of a process
/// that is not ours.
fn install_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        let thread = thread::current();
        error!(
            target: "hands_agent::panic",
            message = %payload,
            location = %location,
            thread = thread.name().unwrap_or("<unnamed>"),
            "PANIC in hands-agent"
        );
    }));
}

/// Body of the bootstrap thread spawned by the load-time entry points.
pub fn bootstrap() {
    let config = match AgentConfig::from_env() {
        Ok(config) => {
            if std::env::var_os(hands_common::config::CONFIG_ENV_VAR).is_some() {
                init_logging(&config.logging);
            } else {
                init_agent_logging();
            }
            config
        }
        Err(e) => {
            init_agent_logging();
            warn!(target: "hands_agent", error = %e, "Invalid agent config, using defaults");
            AgentConfig::default()
        }
    };
    install_panic_handler();

    info!(target: "hands_agent", pid = std::process::id(), "Agent thread started");

    match Agent::new(config).start() {
        Ok(handle) => {
            *RUNNING_AGENT.lock() = Some(handle);
        }
        Err(e) => {
            error!(target: "hands_agent", error = %e, "Agent initialization failed");
        }
    }
}

#[cfg(any(windows, feature = "autostart"))]
fn spawn_bootstrap() {
    if let Err(e) = thread::Builder::new()
        .name("hands-bootstrap".into())
        .spawn(bootstrap)
    {
        // No subscriber yet; stderr is all there is.
        eprintln!("hands-agent: failed to spawn bootstrap thread: {}", e);
    }
}

/// DLL entry point
///
/// # Safety
/// Called by the Windows loader under the loader lock. Must return quickly
/// and must not load libraries or join threads.
#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
    _hinst: windows::Win32::Foundation::HINSTANCE,
    reason: u32,
    _reserved: *mut std::ffi::c_void,
) -> i32 {
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    match reason {
        DLL_PROCESS_ATTACH => {
            spawn_bootstrap();
            1
        }
        DLL_PROCESS_DETACH => {
            if let Some(guard) = RUNNING_AGENT.try_lock() {
                if let Some(handle) = guard.as_ref() {
                    handle.request_shutdown();
                }
            }
            info!(target: "hands_agent", "Agent detaching");
            1
        }
        _ => 1,
    }
}

#[cfg(all(feature = "autostart", any(target_os = "linux", target_os = "android")))]
#[used]
#[link_section = ".init_array"]
static AUTOSTART: extern "C" fn() = {
    extern "C" fn autostart() {
        spawn_bootstrap();
    }
    autostart
};

#[cfg(all(feature = "autostart", target_os = "macos"))]
#[used]
#[link_section = "__DATA,__mod_init_func"]
static AUTOSTART: extern "C" fn() = {
    extern "C" fn autostart() {
        spawn_bootstrap();
    }
    autostart
};
