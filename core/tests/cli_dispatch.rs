pub mod fixtures;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use clap::Parser;
use fixtures::*;
use hostshim_core::cli::{self, Capabilities, Cli};
use hostshim_core::config::Config;
use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::{ComActivator, NoCom, ProcessManager, ProxyDetector, Toaster};
use hostshim_core::process::{ProcessInfo, ProcessStatus, ProcessTable};
use hostshim_core::proxy::{ProxySource, ProxyUrl};
use hostshim_core::service::ServiceEvent;
use hostshim_core::toast::{Toast, ToastOutcome};

struct TwoProcesses;

impl ProcessManager for TwoProcesses {
    fn list_processes(&self) -> Result<ProcessTable> {
        let mut table = ProcessTable::new();
        for (pid, cmd) in [(1, "/sbin/init"), (42, "/usr/bin/agent --flag")] {
            table.insert(
                pid,
                ProcessInfo {
                    pid,
                    user: Some("root".to_string()),
                    cmd: cmd.to_string(),
                    path: None,
                },
            );
        }
        Ok(table)
    }

    fn process_info(&self, pid: u32) -> Result<ProcessStatus> {
        Ok(BTreeMap::from([("Pid".to_string(), pid.to_string())]))
    }

    fn find_by_command(&self, cmd: &str, _path: Option<&str>) -> Result<Vec<u32>> {
        Err(ShimError::NotFound(cmd.to_string()))
    }
}

struct FixedProxy;

impl ProxyDetector for FixedProxy {
    fn detect_proxy(&self) -> Result<ProxyUrl> {
        Ok(ProxyUrl {
            url: "http://proxy.corp:3128".to_string(),
            source: ProxySource::Yum,
        })
    }

    fn should_bypass(&self, host: &str) -> Result<bool> {
        Ok(host == "localhost")
    }
}

#[derive(Default)]
struct RecordingToaster(std::sync::Mutex<Vec<Toast>>);

impl Toaster for RecordingToaster {
    fn toast(&self, toast: &Toast) -> Result<ToastOutcome> {
        self.0.lock().unwrap().push(toast.clone());
        Ok(ToastOutcome::Dismissed)
    }
}

fn no_signals(_events: Sender<ServiceEvent>) -> Result<()> {
    Ok(())
}

fn capabilities(toaster: Arc<RecordingToaster>) -> Capabilities {
    Capabilities {
        processes: Arc::new(TwoProcesses),
        proxy: Arc::new(FixedProxy),
        services: Arc::new(MemoryServiceManager::default()),
        host: Box::new(ScriptedHost(vec![ServiceEvent::NormalStart, ServiceEvent::Stop])),
        toaster,
        com: Arc::new(NoCom),
        stop_signals: no_signals,
    }
}

fn run(args: &[&str]) -> Result<String> {
    run_with(args, Arc::new(RecordingToaster::default()))
}

fn run_with(args: &[&str], toaster: Arc<RecordingToaster>) -> Result<String> {
    let cli = Cli::try_parse_from(std::iter::once("hostshim").chain(args.iter().copied())).unwrap();
    let mut out = Vec::new();
    cli::run(&cli, &capabilities(toaster), &Config::default(), &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

#[test]
fn ps_json_lists_every_process() {
    let text = run(&["ps", "--json"]).unwrap();
    let rows: serde_json::Value = serde_json::from_str(&text).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["pid"], 42);
    assert_eq!(rows[1]["cmd"], "/usr/bin/agent --flag");
    assert!(rows[0].get("path").is_none());
}

#[test]
fn ps_table_has_header() {
    let text = run(&["ps"]).unwrap();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().ends_with("COMMAND"));
    assert_eq!(lines.count(), 2);
}

#[test]
fn proxy_reports_source() {
    assert_eq!(
        run(&["proxy"]).unwrap(),
        "http://proxy.corp:3128 (yum package manager settings)\n"
    );
    assert_eq!(run(&["proxy", "--bypass", "localhost"]).unwrap(), "localhost: bypass\n");
}

#[test]
fn find_propagates_not_found() {
    let err = run(&["find", "ghost"]).unwrap_err();
    assert_eq!(err.to_string(), "ghost not found");
}

#[test]
fn toast_uses_display_name_for_generic_title() {
    let toaster = Arc::new(RecordingToaster::default());
    let text = run_with(&["toast", "", "Backup finished"], toaster.clone()).unwrap();
    assert_eq!(text, "DISMISSED\n");
    let shown = toaster.0.lock().unwrap();
    assert_eq!(shown[0].title, Config::default().toast.title);
    assert_eq!(shown[0].caption, "Backup finished");
}

#[test]
fn service_install_twice_reports_no_op() {
    let caps = capabilities(Arc::new(RecordingToaster::default()));
    let config = Config::default();
    let cli = Cli::try_parse_from(["hostshim", "service", "install"]).unwrap();

    let mut first = Vec::new();
    cli::run(&cli, &caps, &config, &mut first).unwrap();
    let mut second = Vec::new();
    cli::run(&cli, &caps, &config, &mut second).unwrap();

    assert_eq!(String::from_utf8(first).unwrap(), "hostshim installed\n");
    assert_eq!(String::from_utf8(second).unwrap(), "hostshim already installed\n");
}

#[test]
fn service_run_stops_on_stop_event() {
    assert_eq!(run(&["service", "run"]).unwrap(), "");
}

#[derive(Default)]
struct RecordingCom(std::sync::Mutex<Vec<(String, Option<String>)>>);

impl ComActivator for RecordingCom {
    fn activate(&self, clsid: &str, iid: Option<&str>) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .push((clsid.to_string(), iid.map(str::to_string)));
        Ok(())
    }
}

#[test]
fn com_passes_class_and_interface_through() {
    let com = Arc::new(RecordingCom::default());
    let mut caps = capabilities(Arc::new(RecordingToaster::default()));
    caps.com = com.clone() as Arc<dyn ComActivator>;
    let cli = Cli::try_parse_from(["hostshim", "com", "{clsid}", "--iid", "{iid}"]).unwrap();
    let mut out = Vec::new();
    cli::run(&cli, &caps, &Config::default(), &mut out).unwrap();

    assert_eq!(String::from_utf8(out).unwrap(), "{clsid}: created\n");
    assert_eq!(
        com.0.lock().unwrap().as_slice(),
        &[("{clsid}".to_string(), Some("{iid}".to_string()))]
    );
}

#[test]
fn com_without_com_is_unsupported() {
    assert!(matches!(
        run(&["com", "{00021401-0000-0000-C000-000000000046}"]),
        Err(ShimError::Unsupported { feature: "COM", .. })
    ));
}
