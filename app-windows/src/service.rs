//! Service Control Manager registration and the service dispatcher.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::{ServiceHost, ServiceManager};
use hostshim_core::proxy::registry::INSTALLED_BY_VALUE;
use hostshim_core::service::{
    ServiceEvent, ServiceOptions, ServiceState, SessionChange, SessionChangeKind,
};
use log::{debug, error, info, warn};
use winapi::shared::winerror::ERROR_SERVICE_DOES_NOT_EXIST;
use winapi::um::winnt::KEY_SET_VALUE;
use winapi::um::winreg::HKEY_LOCAL_MACHINE;
use windows_service::service::{
    ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
    ServiceInfo, ServiceStartType, ServiceState as ScmState, ServiceStatus, ServiceType,
    SessionChangeReason,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::service_manager::{ServiceManager as Scm, ServiceManagerAccess};
use windows_service::{define_windows_service, service_dispatcher};

use crate::com::ComApartment;
use crate::proxy::service_key_path;
use crate::registry::RegKey;
use crate::win32;

fn scm_error(err: windows_service::Error) -> ShimError {
    ShimError::Service(err.to_string())
}

fn does_not_exist(err: &windows_service::Error) -> bool {
    matches!(err, windows_service::Error::Winapi(io)
        if io.raw_os_error() == Some(ERROR_SERVICE_DOES_NOT_EXIST as i32))
}

fn connect(access: ServiceManagerAccess) -> Result<Scm> {
    Scm::local_computer(None::<&str>, access).map_err(scm_error)
}

/// Services registered with the local SCM as auto-start, own-process.
#[derive(Default)]
pub struct ScmServiceManager;

impl ScmServiceManager {
    /// Records who installed the service so a session 0 proxy lookup can
    /// read that user's hive.
    fn record_installer(&self, name: &str) -> Result<()> {
        let sid = win32::with_token_sid(&win32::own_token()?, win32::sid_to_string)?;
        let key = RegKey::open(HKEY_LOCAL_MACHINE, &service_key_path(name), KEY_SET_VALUE)?;
        key.set_string(INSTALLED_BY_VALUE, &sid)?;
        debug!("{name} installed by {sid}");
        Ok(())
    }
}

impl ServiceManager for ScmServiceManager {
    fn is_installed(&self, name: &str) -> Result<bool> {
        let manager = connect(ServiceManagerAccess::CONNECT)?;
        match manager.open_service(name, ServiceAccess::QUERY_STATUS) {
            Ok(_) => Ok(true),
            Err(e) if does_not_exist(&e) => Ok(false),
            Err(e) => Err(scm_error(e)),
        }
    }

    fn install(&self, opts: &ServiceOptions) -> Result<()> {
        let manager = connect(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;
        let info = ServiceInfo {
            name: OsString::from(&opts.name),
            display_name: OsString::from(&opts.display_name),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: PathBuf::from(&opts.service_path),
            launch_arguments: opts.args.iter().map(OsString::from).collect(),
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        let service = manager
            .create_service(&info, ServiceAccess::CHANGE_CONFIG)
            .map_err(scm_error)?;
        if let Some(description) = &opts.description {
            service.set_description(description).map_err(scm_error)?;
        }
        if let Err(e) = self.record_installer(&opts.name) {
            warn!("Could not record installing user: {e}");
        }
        info!("Created service {}", opts.name);
        Ok(())
    }

    fn uninstall(&self, opts: &ServiceOptions) -> Result<()> {
        let manager = connect(ServiceManagerAccess::CONNECT)?;
        let access = ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE;
        let service = manager.open_service(&opts.name, access).map_err(scm_error)?;

        let status = service.query_status().map_err(scm_error)?;
        if status.current_state != ScmState::Stopped {
            if let Err(e) = service.stop() {
                warn!("Failed to stop {} before removal: {e}", opts.name);
            }
        }
        service.delete().map_err(scm_error)?;
        info!("Deleted service {}", opts.name);
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        let manager = connect(ServiceManagerAccess::CONNECT)?;
        let service = manager
            .open_service(name, ServiceAccess::START)
            .map_err(scm_error)?;
        service.start(&[] as &[&str]).map_err(scm_error)
    }

    fn stop(&self, name: &str) -> Result<()> {
        let manager = connect(ServiceManagerAccess::CONNECT)?;
        let service = manager
            .open_service(name, ServiceAccess::STOP)
            .map_err(scm_error)?;
        service.stop().map(|_| ()).map_err(scm_error)
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        let manager = connect(ServiceManagerAccess::CONNECT)?;
        let service = match manager.open_service(name, ServiceAccess::QUERY_STATUS) {
            Ok(service) => service,
            Err(e) if does_not_exist(&e) => return Ok(ServiceState::NotInstalled),
            Err(e) => return Err(scm_error(e)),
        };
        let status = service.query_status().map_err(scm_error)?;
        Ok(match status.current_state {
            ScmState::Running => ServiceState::Running,
            ScmState::Stopped => ServiceState::Stopped,
            _ => ServiceState::Unknown,
        })
    }
}

/// Maps an SCM control request to the event it produces, if any.
pub fn control_event(control: &ServiceControl) -> Option<ServiceEvent> {
    match control {
        ServiceControl::Stop | ServiceControl::Shutdown => Some(ServiceEvent::Stop),
        ServiceControl::PowerEvent(_) => Some(ServiceEvent::PowerEvent),
        ServiceControl::SessionChange(param) => {
            let kind = match param.reason {
                SessionChangeReason::SessionLogon => SessionChangeKind::Logon,
                SessionChangeReason::SessionLogoff => SessionChangeKind::Logoff,
                _ => return None,
            };
            Some(ServiceEvent::SessionChange(SessionChange {
                kind,
                session_id: param.notification.session_id,
            }))
        }
        _ => None,
    }
}

/// What the dispatcher thread needs once the SCM calls back into us.
struct HostContext {
    name: String,
    events: Sender<ServiceEvent>,
}

/// `service_main` is a bare function pointer, so the context is parked here
/// by [`ScmServiceHost::run`] and taken exactly once.
static CONTEXT: Mutex<Option<HostContext>> = Mutex::new(None);

define_windows_service!(ffi_service_main, service_main);

fn service_main(_arguments: Vec<OsString>) {
    let context = CONTEXT.lock().unwrap_or_else(PoisonError::into_inner).take();
    let Some(context) = context else {
        error!("Service started without a host context");
        return;
    };
    if let Err(e) = run_service(&context) {
        error!("Service {} failed: {e}", context.name);
    }
}

fn status(state: ScmState, controls_accepted: ServiceControlAccept) -> ServiceStatus {
    ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted,
        exit_code: ServiceExitCode::Win32(0),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }
}

fn forward(events: &Sender<ServiceEvent>, event: ServiceEvent) {
    if events.send(event).is_err() {
        warn!("Dropped {event:?}: event loop is gone");
    }
}

fn run_service(context: &HostContext) -> Result<()> {
    // Held until the service reports Stopped.
    let _com = ComApartment::initialize()?;
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let events = context.events.clone();

    let handler = move |control: ServiceControl| -> ServiceControlHandlerResult {
        if let ServiceControl::Interrogate = control {
            return ServiceControlHandlerResult::NoError;
        }
        match control_event(&control) {
            Some(event) => {
                forward(&events, event);
                if event == ServiceEvent::Stop {
                    let _ = shutdown_tx.send(());
                }
                ServiceControlHandlerResult::NoError
            }
            None => ServiceControlHandlerResult::NotImplemented,
        }
    };

    let handle = service_control_handler::register(&context.name, handler).map_err(scm_error)?;
    handle
        .set_service_status(status(ScmState::StartPending, ServiceControlAccept::empty()))
        .map_err(scm_error)?;
    handle
        .set_service_status(status(
            ScmState::Running,
            ServiceControlAccept::STOP
                | ServiceControlAccept::SHUTDOWN
                | ServiceControlAccept::POWER_EVENT
                | ServiceControlAccept::SESSION_CHANGE,
        ))
        .map_err(scm_error)?;
    forward(&context.events, ServiceEvent::Start);

    let _ = shutdown_rx.recv();
    handle
        .set_service_status(status(ScmState::Stopped, ServiceControlAccept::empty()))
        .map_err(scm_error)?;
    Ok(())
}

/// Hands the process to the service dispatcher, which blocks until the SCM
/// stops us. Outside the SCM the dispatcher fails straight away and the run
/// continues as a normal start.
#[derive(Default)]
pub struct ScmServiceHost;

impl ServiceHost for ScmServiceHost {
    fn run(&self, opts: &ServiceOptions, events: Sender<ServiceEvent>) -> Result<()> {
        *CONTEXT.lock().unwrap_or_else(PoisonError::into_inner) = Some(HostContext {
            name: opts.name.clone(),
            events: events.clone(),
        });

        if let Err(e) = service_dispatcher::start(&opts.name, ffi_service_main) {
            debug!("Service dispatcher unavailable: {e}");
            CONTEXT.lock().unwrap_or_else(PoisonError::into_inner).take();
            forward(&events, ServiceEvent::NormalStart);
        }
        Ok(())
    }
}
