//! COM apartment setup and object creation.

use std::marker::PhantomData;
use std::mem::zeroed;
use std::ptr::{NonNull, null_mut};

use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::ComActivator;
use log::{debug, info};
use winapi::Interface;
use winapi::shared::guiddef::GUID;
use winapi::shared::rpcdce::{RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE};
use winapi::shared::winerror::{FAILED, HRESULT, RPC_E_TOO_LATE};
use winapi::shared::wtypesbase::{CLSCTX_INPROC_SERVER, CLSCTX_LOCAL_SERVER};
use winapi::um::combaseapi::{
    CLSIDFromString, CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoUninitialize,
    IIDFromString,
};
use winapi::um::objbase::COINIT_MULTITHREADED;
use winapi::um::objidl::EOAC_NONE;
use winapi::um::unknwnbase::IUnknown;

use crate::win32::to_wide_string;

/// `{00000000-0000-0000-C000-000000000046}`
pub const IID_IUNKNOWN: GUID = GUID {
    Data1: 0x0000_0000,
    Data2: 0x0000,
    Data3: 0x0000,
    Data4: [0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46],
};

fn check(call: &'static str, hresult: HRESULT) -> Result<()> {
    if FAILED(hresult) {
        Err(ShimError::Com { call, hresult })
    } else {
        Ok(())
    }
}

/// A multithreaded COM apartment for the current thread, left on drop.
pub struct ComApartment {
    // CoUninitialize must run on the thread that initialized.
    _thread_bound: PhantomData<*const ()>,
}

impl ComApartment {
    pub fn initialize() -> Result<Self> {
        check("CoInitializeEx", unsafe {
            CoInitializeEx(null_mut(), COINIT_MULTITHREADED)
        })?;
        let apartment = Self {
            _thread_bound: PhantomData,
        };

        let hresult = unsafe {
            CoInitializeSecurity(
                null_mut(),
                -1,
                null_mut(),
                null_mut(),
                RPC_C_AUTHN_LEVEL_DEFAULT,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                null_mut(),
                EOAC_NONE,
                null_mut(),
            )
        };
        // Process-wide security can only be set once.
        if hresult == RPC_E_TOO_LATE {
            debug!("COM security already initialized");
        } else {
            check("CoInitializeSecurity", hresult)?;
        }
        Ok(apartment)
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        unsafe { CoUninitialize() };
    }
}

/// An owned interface pointer, released on drop.
pub struct ComPtr<T: Interface>(NonNull<T>);

impl<T: Interface> ComPtr<T> {
    fn unknown(&self) -> &IUnknown {
        unsafe { &*(self.0.as_ptr() as *const IUnknown) }
    }

    /// `QueryInterface` for `iid`, held as `IUnknown`.
    pub fn query(&self, iid: &GUID) -> Result<ComPtr<IUnknown>> {
        let mut raw = null_mut();
        check("QueryInterface", unsafe {
            self.unknown().QueryInterface(iid, &mut raw)
        })?;
        NonNull::new(raw.cast::<IUnknown>())
            .map(ComPtr)
            .ok_or(ShimError::Com {
                call: "QueryInterface",
                hresult: 0,
            })
    }
}

impl<T: Interface> Drop for ComPtr<T> {
    fn drop(&mut self) {
        unsafe { self.unknown().Release() };
    }
}

/// Creates an in-process or local-server instance of `clsid` and asks it
/// for `T`.
pub fn create_instance<T: Interface>(clsid: &GUID) -> Result<ComPtr<T>> {
    let mut raw = null_mut();
    check("CoCreateInstance", unsafe {
        CoCreateInstance(
            clsid,
            null_mut(),
            CLSCTX_INPROC_SERVER | CLSCTX_LOCAL_SERVER,
            &T::uuidof(),
            &mut raw,
        )
    })?;
    NonNull::new(raw.cast::<T>())
        .map(ComPtr)
        .ok_or(ShimError::Com {
            call: "CoCreateInstance",
            hresult: 0,
        })
}

/// Parses `{xxxxxxxx-...}` or a ProgID into a CLSID.
pub fn clsid_from_string(text: &str) -> Result<GUID> {
    let wide = to_wide_string(text);
    let mut guid: GUID = unsafe { zeroed() };
    check("CLSIDFromString", unsafe {
        CLSIDFromString(wide.as_ptr(), &mut guid)
    })?;
    Ok(guid)
}

pub fn iid_from_string(text: &str) -> Result<GUID> {
    let wide = to_wide_string(text);
    let mut guid: GUID = unsafe { zeroed() };
    check("IIDFromString", unsafe { IIDFromString(wide.as_ptr(), &mut guid) })?;
    Ok(guid)
}

/// Backs the `com` command: creates the object in a fresh apartment and
/// releases it once the requested interface answers.
pub struct ComObjects;

impl ComActivator for ComObjects {
    fn activate(&self, clsid: &str, iid: Option<&str>) -> Result<()> {
        let _apartment = ComApartment::initialize()?;
        let class = clsid_from_string(clsid)?;
        let interface = match iid {
            Some(text) => iid_from_string(text)?,
            None => IID_IUNKNOWN,
        };
        let object = create_instance::<IUnknown>(&class)?;
        object.query(&interface)?;
        info!("Created {clsid}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shell link object, registered in-process on every Windows install.
    const CLSID_SHELL_LINK: &str = "{00021401-0000-0000-C000-000000000046}";
    /// `IPersistFile`, which the shell link implements.
    const IID_PERSIST_FILE: &str = "{0000010B-0000-0000-C000-000000000046}";

    fn same(a: &GUID, b: &GUID) -> bool {
        (a.Data1, a.Data2, a.Data3, a.Data4) == (b.Data1, b.Data2, b.Data3, b.Data4)
    }

    #[test]
    fn iunknown_iid_round_trips() {
        let parsed = iid_from_string("{00000000-0000-0000-C000-000000000046}").unwrap();
        assert!(same(&parsed, &IID_IUNKNOWN));
        assert!(same(&IUnknown::uuidof(), &IID_IUNKNOWN));
    }

    #[test]
    fn malformed_clsid_is_an_hresult_error() {
        assert!(matches!(
            clsid_from_string("not-a-guid"),
            Err(ShimError::Com {
                call: "CLSIDFromString",
                ..
            })
        ));
    }

    #[test]
    fn apartment_nests_on_one_thread() {
        let outer = ComApartment::initialize().unwrap();
        // Second init returns S_FALSE and security reports RPC_E_TOO_LATE.
        let inner = ComApartment::initialize().unwrap();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn activates_shell_link_interfaces() {
        ComObjects.activate(CLSID_SHELL_LINK, None).unwrap();
        ComObjects
            .activate(CLSID_SHELL_LINK, Some(IID_PERSIST_FILE))
            .unwrap();
    }

    #[test]
    fn unknown_class_is_an_hresult_error() {
        assert!(matches!(
            ComObjects.activate("{DEADBEEF-0000-0000-0000-000000000000}", None),
            Err(ShimError::Com { .. })
        ));
    }
}
