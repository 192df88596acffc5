use std::fmt::{self, Display};

use clap::ValueEnum;

/// Target CPU of the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Arch {
    Arm,
    Arm64,
    X86,
    X64,
}

impl Arch {
    /// Also the GN `target_cpu` value.
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::X86 => "x86",
            Arch::X64 => "x64",
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, Arch::Arm64 | Arch::X64)
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which app the orderfile is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Browser {
    Chrome,
    WebView,
}

impl Browser {
    pub fn from_webview_flag(webview: bool) -> Self {
        if webview {
            Browser::WebView
        } else {
            Browser::Chrome
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Browser::Chrome => "chrome",
            Browser::WebView => "webview",
        }
    }
}

impl Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
