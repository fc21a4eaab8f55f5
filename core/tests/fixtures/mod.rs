#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::{ServiceHost, ServiceManager, SessionProvider};
use hostshim_core::service::{ServiceEvent, ServiceOptions, ServiceState};
use hostshim_core::session::XInfo;
use hostshim_core::shell::{CommandOutput, CommandRunner, CommandSpec};

/// Answers commands from a table keyed by the displayed command line.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: BTreeMap<String, String>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn reply(mut self, command: &str, stdout: &str) -> Self {
        self.replies.insert(command.to_string(), stdout.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        self.calls.lock().unwrap().push(line.clone());
        match self.replies.get(&line) {
            Some(stdout) => Ok(CommandOutput {
                code: Some(0),
                stdout: stdout.clone(),
                ..CommandOutput::default()
            }),
            None => Err(ShimError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, line),
            }),
        }
    }
}

/// A host with one fixed console user.
pub struct StaticSessions {
    pub own_uid: u32,
    pub console_uid: Option<u32>,
}

impl SessionProvider for StaticSessions {
    fn own_uid(&self) -> u32 {
        self.own_uid
    }

    fn console_uid(&self) -> Result<u32> {
        self.console_uid.ok_or(ShimError::NoUserSession)
    }

    fn username(&self, uid: u32) -> Result<String> {
        Ok(format!("user{uid}"))
    }

    fn user_env(&self, _uid: u32, _key: &str) -> Option<String> {
        None
    }

    fn x_info(&self, _uid: u32) -> Result<XInfo> {
        Ok(XInfo::default())
    }
}

/// Keeps registrations in memory and counts real installs/uninstalls.
#[derive(Default)]
pub struct MemoryServiceManager {
    pub installed: Mutex<Vec<String>>,
    pub installs: Mutex<u32>,
    pub uninstalls: Mutex<u32>,
}

impl ServiceManager for MemoryServiceManager {
    fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(self.installed.lock().unwrap().iter().any(|n| n == name))
    }

    fn install(&self, opts: &ServiceOptions) -> Result<()> {
        *self.installs.lock().unwrap() += 1;
        self.installed.lock().unwrap().push(opts.name.clone());
        Ok(())
    }

    fn uninstall(&self, opts: &ServiceOptions) -> Result<()> {
        *self.uninstalls.lock().unwrap() += 1;
        self.installed.lock().unwrap().retain(|n| *n != opts.name);
        Ok(())
    }

    fn start(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        Ok(if self.is_installed(name)? {
            ServiceState::Stopped
        } else {
            ServiceState::NotInstalled
        })
    }
}

/// Emits a fixed sequence of events, the way a service manager would.
pub struct ScriptedHost(pub Vec<ServiceEvent>);

impl ServiceHost for ScriptedHost {
    fn run(&self, _opts: &ServiceOptions, events: Sender<ServiceEvent>) -> Result<()> {
        for event in &self.0 {
            events
                .send(*event)
                .map_err(|e| ShimError::Service(e.to_string()))?;
        }
        Ok(())
    }
}

pub fn options() -> ServiceOptions {
    ServiceOptions {
        name: "hostshim".to_string(),
        display_name: "Host Shim Agent".to_string(),
        description: None,
        service_path: "/usr/local/bin/hostshim".to_string(),
        args: vec!["service".to_string(), "run".to_string()],
    }
}

pub fn write(root: &Path, path: &str, contents: &str) {
    let full = root.join(path.trim_start_matches('/'));
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, contents).unwrap();
}
