pub mod fixtures;

use std::sync::mpsc;

use fixtures::*;
use hostshim_core::cli::serve;
use hostshim_core::platform::ServiceManager;
use hostshim_core::service::{
    InstallOutcome, ServiceEvent, SessionChange, SessionChangeKind, UninstallOutcome,
    install_service, uninstall_service,
};

#[test]
fn install_is_idempotent() {
    let manager = MemoryServiceManager::default();
    let opts = options();

    assert_eq!(install_service(&manager, &opts).unwrap(), InstallOutcome::Installed);
    assert_eq!(
        install_service(&manager, &opts).unwrap(),
        InstallOutcome::AlreadyInstalled
    );
    assert_eq!(*manager.installs.lock().unwrap(), 1);
    assert!(manager.is_installed("hostshim").unwrap());
}

#[test]
fn uninstall_is_idempotent() {
    let manager = MemoryServiceManager::default();
    let opts = options();

    assert_eq!(
        uninstall_service(&manager, &opts).unwrap(),
        UninstallOutcome::NotInstalled
    );
    assert_eq!(*manager.uninstalls.lock().unwrap(), 0);

    install_service(&manager, &opts).unwrap();
    assert_eq!(
        uninstall_service(&manager, &opts).unwrap(),
        UninstallOutcome::Uninstalled
    );
    assert_eq!(
        uninstall_service(&manager, &opts).unwrap(),
        UninstallOutcome::NotInstalled
    );
    assert_eq!(*manager.uninstalls.lock().unwrap(), 1);
}

#[test]
fn serve_returns_once_stopped() {
    let host = ScriptedHost(vec![
        ServiceEvent::Start,
        ServiceEvent::SessionChange(SessionChange {
            kind: SessionChangeKind::Logon,
            session_id: 2,
        }),
        ServiceEvent::PowerEvent,
        ServiceEvent::Stop,
    ]);
    let (tx, rx) = mpsc::channel();
    serve(&host, &options(), tx, rx).unwrap();
}
