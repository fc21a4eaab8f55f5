//! Registry keys, read through `winreg.h`.

use std::ptr::null_mut;

use hostshim_core::error::{Result, ShimError};
use winapi::shared::minwindef::{DWORD, HKEY};
use winapi::shared::winerror::{ERROR_FILE_NOT_FOUND, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS};
use winapi::um::winnt::{REG_DWORD, REG_EXPAND_SZ, REG_SZ};
use winapi::um::winreg::{
    REGSAM, RegCloseKey, RegEnumKeyExW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW,
};

use crate::win32::{from_wide, os_error, to_wide_string};

/// An open registry key, closed on drop.
pub struct RegKey(HKEY);

impl RegKey {
    pub fn open(parent: HKEY, path: &str, access: REGSAM) -> Result<Self> {
        let wide = to_wide_string(path);
        let mut key: HKEY = null_mut();
        let status = unsafe { RegOpenKeyExW(parent, wide.as_ptr(), 0, access, &mut key) };
        match status as DWORD {
            ERROR_SUCCESS => Ok(Self(key)),
            ERROR_FILE_NOT_FOUND => Err(ShimError::NotFound(format!("registry key {path}"))),
            _ => Err(os_error("RegOpenKeyExW", status)),
        }
    }

    /// Raw value bytes and type, or `None` when the value is absent.
    fn value(&self, name: &str) -> Result<Option<(DWORD, Vec<u8>)>> {
        let wide = to_wide_string(name);
        let mut kind: DWORD = 0;
        let mut size: DWORD = 0;
        let status = unsafe {
            RegQueryValueExW(self.0, wide.as_ptr(), null_mut(), &mut kind, null_mut(), &mut size)
        };
        match status as DWORD {
            ERROR_SUCCESS => {}
            ERROR_FILE_NOT_FOUND => return Ok(None),
            _ => return Err(os_error("RegQueryValueExW", status)),
        }

        let mut data = vec![0u8; size as usize];
        let status = unsafe {
            RegQueryValueExW(
                self.0,
                wide.as_ptr(),
                null_mut(),
                &mut kind,
                data.as_mut_ptr(),
                &mut size,
            )
        };
        if status as DWORD != ERROR_SUCCESS {
            return Err(os_error("RegQueryValueExW", status));
        }
        data.truncate(size as usize);
        Ok(Some((kind, data)))
    }

    pub fn string(&self, name: &str) -> Result<Option<String>> {
        match self.value(name)? {
            Some((REG_SZ | REG_EXPAND_SZ, data)) => {
                let units: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(Some(from_wide(&units)))
            }
            Some((kind, _)) => Err(ShimError::Parse(format!(
                "{name} has registry type {kind}, expected a string"
            ))),
            None => Ok(None),
        }
    }

    pub fn dword(&self, name: &str) -> Result<Option<u32>> {
        match self.value(name)? {
            Some((REG_DWORD, data)) if data.len() == 4 => {
                Ok(Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]])))
            }
            Some((kind, _)) => Err(ShimError::Parse(format!(
                "{name} has registry type {kind}, expected a DWORD"
            ))),
            None => Ok(None),
        }
    }

    pub fn set_string(&self, name: &str, value: &str) -> Result<()> {
        let wide_name = to_wide_string(name);
        let data = to_wide_string(value);
        let status = unsafe {
            RegSetValueExW(
                self.0,
                wide_name.as_ptr(),
                0,
                REG_SZ,
                data.as_ptr().cast(),
                (data.len() * 2) as DWORD,
            )
        };
        if status as DWORD != ERROR_SUCCESS {
            return Err(os_error("RegSetValueExW", status));
        }
        Ok(())
    }

    /// Names of the immediate subkeys.
    pub fn subkeys(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut index = 0;
        loop {
            let mut name = [0u16; 256];
            let mut len = name.len() as DWORD;
            let status = unsafe {
                RegEnumKeyExW(
                    self.0,
                    index,
                    name.as_mut_ptr(),
                    &mut len,
                    null_mut(),
                    null_mut(),
                    null_mut(),
                    null_mut(),
                )
            };
            match status as DWORD {
                ERROR_SUCCESS => names.push(from_wide(&name[..len as usize])),
                ERROR_NO_MORE_ITEMS => break,
                _ => return Err(os_error("RegEnumKeyExW", status)),
            }
            index += 1;
        }
        Ok(names)
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe { RegCloseKey(self.0) };
    }
}
