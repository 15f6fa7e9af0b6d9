//! Dynamic Library Loader
//!
//! Wrapper around libloading for loading shared libraries and resolving
//! symbols. Some distributions install `libfoo.so` as a linker script
//! (`GROUP ( libfoo.so.1 ... )`) rather than an ELF object; when dlopen
//! rejects such a file the script is read and its first target is opened
//! instead.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info};

use super::error::{FfiError, FfiResult};

/// How deep linker-script redirections may nest
pub const MAX_REDIRECTS: usize = 8;

/// Leading `<file>.so…:` of a dlopen error message
static SO_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(([^ \t()])+\.so([^ \t:()])*):([ \t])*").expect("valid regex")
});

/// First target of a linker script `GROUP ( … )` directive
static GROUP_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"GROUP *\( *(([^ )])+)").expect("valid regex"));

/// Symbol binding mode for `DynamicLibrary::open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// Resolve symbols on first use (`RTLD_LAZY`) instead of at load time
    pub lazy: bool,
    /// Make the library's symbols available to later loads (`RTLD_GLOBAL`)
    pub global: bool,
}

impl Default for OpenMode {
    fn default() -> Self {
        Self {
            lazy: true,
            global: false,
        }
    }
}

/// A dynamically loaded library
pub struct DynamicLibrary {
    /// Path the library was opened from, after redirection
    path: PathBuf,
    /// The loaded library handle; `None` once closed
    library: Mutex<Option<Library>>,
    /// Cached function symbols
    symbols: Mutex<HashMap<String, usize>>,
}

impl DynamicLibrary {
    /// Load a library, following linker-script redirections
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> FfiResult<Self> {
        Self::open_at_depth(path.as_ref(), mode, 0)
    }

    fn open_at_depth(path: &Path, mode: OpenMode, depth: usize) -> FfiResult<Self> {
        match open_raw(path, mode) {
            Ok(library) => {
                info!(path = %path.display(), lazy = mode.lazy, "loaded library");
                Ok(Self::from_library(path.to_path_buf(), library))
            }
            Err(reason) => {
                let target = if depth < MAX_REDIRECTS {
                    redirect_target(&reason)
                } else {
                    None
                };
                match target {
                    Some(target) => {
                        info!(
                            from = %path.display(),
                            to = %target.display(),
                            "following linker script"
                        );
                        Self::open_at_depth(&target, mode, depth + 1)
                    }
                    None => Err(FfiError::LibraryLoad {
                        path: path.display().to_string(),
                        reason,
                    }),
                }
            }
        }
    }

    /// Handle on the running program and everything it has loaded
    #[cfg(unix)]
    pub fn open_self() -> FfiResult<Self> {
        let library: Library = libloading::os::unix::Library::this().into();
        debug!("opened handle on the running process");
        Ok(Self::from_library(PathBuf::from("<self>"), library))
    }

    #[cfg(windows)]
    pub fn open_self() -> FfiResult<Self> {
        let library: Library = libloading::os::windows::Library::this()
            .map_err(|e| FfiError::LibraryLoad {
                path: "<self>".to_string(),
                reason: e.to_string(),
            })?
            .into();
        Ok(Self::from_library(PathBuf::from("<self>"), library))
    }

    fn from_library(path: PathBuf, library: Library) -> Self {
        Self {
            path,
            library: Mutex::new(Some(library)),
            symbols: Mutex::new(HashMap::new()),
        }
    }

    /// Get the path to this library
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.library.lock().is_some()
    }

    fn not_found(&self, symbol: &str, reason: impl Into<String>) -> FfiError {
        FfiError::SymbolNotFound {
            library: self.path.display().to_string(),
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Address of an exported symbol. A failed lookup leaves the handle usable.
    pub fn get(&self, symbol: &str) -> FfiResult<usize> {
        if let Some(&addr) = self.symbols.lock().get(symbol) {
            return Ok(addr);
        }

        let guard = self.library.lock();
        let library = guard
            .as_ref()
            .ok_or_else(|| self.not_found(symbol, "library is closed"))?;

        let mut name = Vec::with_capacity(symbol.len() + 1);
        name.extend_from_slice(symbol.as_bytes());
        name.push(0);

        // Safety: the address is only read here; its type is checked at the
        // call site against a call descriptor.
        let addr = unsafe {
            let sym: Symbol<*mut c_void> = library
                .get(&name)
                .map_err(|e| self.not_found(symbol, e.to_string()))?;
            *sym as usize
        };
        if addr == 0 {
            return Err(self.not_found(symbol, "symbol resolves to null"));
        }

        debug!(
            library = %self.path.display(),
            symbol,
            addr = %format!("{:#x}", addr),
            "resolved symbol"
        );
        self.symbols.lock().insert(symbol.to_string(), addr);
        Ok(addr)
    }

    /// Release the module. Later lookups fail with `SymbolNotFound`.
    pub fn close(&self) -> FfiResult<()> {
        self.symbols.lock().clear();
        match self.library.lock().take() {
            Some(library) => {
                debug!(path = %self.path.display(), "closing library");
                library.close().map_err(|e| FfiError::LibraryLoad {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("symbols", &self.symbols.lock().len())
            .finish()
    }
}

#[cfg(unix)]
fn open_raw(path: &Path, mode: OpenMode) -> Result<Library, String> {
    use libloading::os::unix;

    let mut flags = if mode.lazy {
        unix::RTLD_LAZY
    } else {
        unix::RTLD_NOW
    };
    flags |= if mode.global {
        unix::RTLD_GLOBAL
    } else {
        unix::RTLD_LOCAL
    };
    // Safety: loading a library runs its initializers; the caller chose it.
    unsafe { unix::Library::open(Some(path), flags) }
        .map(Library::from)
        .map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn open_raw(path: &Path, _mode: OpenMode) -> Result<Library, String> {
    unsafe { Library::new(path) }.map_err(|e| e.to_string())
}

/// Where a failed load should be retried, if the failure names a linker script
pub fn redirect_target(error: &str) -> Option<PathBuf> {
    let script = SO_ERROR.captures(error)?.get(1)?.as_str();
    let content = std::fs::read_to_string(script).ok()?;
    parse_linker_script(&content)
}

/// First `GROUP ( … )` target of a linker script
pub fn parse_linker_script(content: &str) -> Option<PathBuf> {
    GROUP_TARGET
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| PathBuf::from(m.as_str()))
}

/// Library loader with search paths
#[derive(Debug, Clone)]
pub struct LibraryLoader {
    /// Search paths for libraries
    search_paths: Vec<PathBuf>,
    mode: OpenMode,
}

impl LibraryLoader {
    /// Create a new library loader
    pub fn new() -> Self {
        Self {
            search_paths: default_search_paths(),
            mode: OpenMode::default(),
        }
    }

    /// Loader that tries `extra` before the platform defaults
    pub fn with_paths(extra: &[PathBuf], mode: OpenMode) -> Self {
        let mut search_paths = extra.to_vec();
        search_paths.extend(default_search_paths());
        Self { search_paths, mode }
    }

    /// Add a search path
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Find a library by name
    pub fn find_library(&self, name: &str) -> Option<PathBuf> {
        // If it's already a path, check if it exists
        let path = Path::new(name);
        if path.exists() {
            return Some(path.to_path_buf());
        }

        let lib_name = library_filename(name);
        self.search_paths
            .iter()
            .map(|dir| dir.join(&lib_name))
            .find(|candidate| candidate.exists())
    }

    /// Open a library by path or short name. Names not found on the search
    /// path are handed to the system loader unchanged.
    pub fn open(&self, name: &str) -> FfiResult<DynamicLibrary> {
        let path = self
            .find_library(name)
            .unwrap_or_else(|| PathBuf::from(name));
        DynamicLibrary::open(path, self.mode)
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the default library search paths for this platform
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/lib64"));
        paths.push(PathBuf::from("/usr/lib64"));

        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(ld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));

        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(dyld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    paths
}

/// Construct the platform-specific library filename
pub fn library_filename(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") && name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(windows)]
    {
        if name.ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if name.starts_with("lib") && name.contains(".so") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }
}
