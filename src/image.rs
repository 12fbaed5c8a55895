//! The loaded module the fixes operate on

use std::path::{Path, PathBuf};

use crate::pattern::ScanRegion;

/// A module mapped into the current process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    /// Load address
    base: usize,
    /// Size of the mapped image in bytes
    size: usize,
    /// File the module was loaded from, if known
    path: Option<PathBuf>,
}

impl ModuleImage {
    /// Describes the module mapped at `base`.
    ///
    /// # Safety
    ///
    /// `size` bytes starting at `base` must stay mapped and readable for as long as the image is used
    pub unsafe fn new(base: usize, size: usize, path: Option<PathBuf>) -> Self {
        Self { base, size, path }
    }

    /// The main executable of the current process
    #[cfg(windows)]
    pub fn main() -> windows::core::Result<Self> {
        use std::mem;

        use windows::Win32::System::LibraryLoader::{GetModuleFileNameW, GetModuleHandleW};
        use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
        use windows::Win32::System::Threading::GetCurrentProcess;

        // SAFETY: a null name asks for the executable, which stays loaded for the life of the process
        let module = unsafe { GetModuleHandleW(None)? };

        let mut info = MODULEINFO::default();
        // SAFETY: `info` is a valid MODULEINFO and its size is passed along
        unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                module,
                &mut info,
                mem::size_of::<MODULEINFO>() as u32,
            )?;
        }

        let mut buf = [0u16; 1024];
        // SAFETY: writes at most `buf.len()` characters
        let len = unsafe { GetModuleFileNameW(module, &mut buf) } as usize;
        let path = (len > 0).then(|| PathBuf::from(String::from_utf16_lossy(&buf[..len])));

        Ok(Self {
            base: info.lpBaseOfDll as usize,
            size: info.SizeOfImage as usize,
            path,
        })
    }

    /// Load address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the mapped image
    pub fn size(&self) -> usize {
        self.size
    }

    /// File the module was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// File name of the module, if the path is known
    pub fn name(&self) -> Option<&str> {
        self.path()?.file_name()?.to_str()
    }

    /// The whole image, for pattern scans
    pub fn region(&self) -> ScanRegion {
        // Safety: upheld by the constructor
        unsafe { ScanRegion::from_raw(self.base, self.size) }
    }

    /// Offset of `address` from the load address
    pub fn rva(&self, address: usize) -> usize {
        address.wrapping_sub(self.base)
    }
}
