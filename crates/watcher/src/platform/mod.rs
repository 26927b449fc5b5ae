//! Native run loops, one per platform family

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::WindowsRunLoop as NativeRunLoop;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use self::macos::MacRunLoop as NativeRunLoop;

#[cfg(not(any(windows, target_os = "macos")))]
mod linux;
#[cfg(not(any(windows, target_os = "macos")))]
pub use self::linux::LinuxRunLoop as NativeRunLoop;
