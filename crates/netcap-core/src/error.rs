//! Error taxonomy carried inside lifecycle messages.

/// Numeric error kinds reported in `CaptureFinished` / `CaptureFailed` /
/// `CleanCompressFailed` messages. The values are part of the operator
/// surface (they appear in logs and status bodies) and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureErrorCode {
    None,
    Unknown,

    StartInvalidParams,
    StartNoPermission,
    StartInterfaceNotFound,
    StartProcessNotFound,
    StartCaptureFailed,
    StartCreateFileFailed,

    RunCaptureDied,
    RunDiskFull,
    RunTimeout,
    RunCancelled,
    RunProcessDied,

    CleanCompressFailed,
    CleanDeleteFailed,
    CleanDiskFull,
}

impl CaptureErrorCode {
    pub fn code(self) -> u32 {
        match self {
            CaptureErrorCode::None => 0,
            CaptureErrorCode::Unknown => 1,
            CaptureErrorCode::StartInvalidParams => 100,
            CaptureErrorCode::StartNoPermission => 101,
            CaptureErrorCode::StartInterfaceNotFound => 102,
            CaptureErrorCode::StartProcessNotFound => 103,
            CaptureErrorCode::StartCaptureFailed => 104,
            CaptureErrorCode::StartCreateFileFailed => 105,
            CaptureErrorCode::RunCaptureDied => 200,
            CaptureErrorCode::RunDiskFull => 201,
            CaptureErrorCode::RunTimeout => 202,
            CaptureErrorCode::RunCancelled => 203,
            CaptureErrorCode::RunProcessDied => 204,
            CaptureErrorCode::CleanCompressFailed => 300,
            CaptureErrorCode::CleanDeleteFailed => 301,
            CaptureErrorCode::CleanDiskFull => 302,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaptureErrorCode::None => "ok",
            CaptureErrorCode::Unknown => "unknown_error",
            CaptureErrorCode::StartInvalidParams => "invalid_parameters",
            CaptureErrorCode::StartNoPermission => "no_permission",
            CaptureErrorCode::StartInterfaceNotFound => "interface_not_found",
            CaptureErrorCode::StartProcessNotFound => "process_not_found",
            CaptureErrorCode::StartCaptureFailed => "capture_start_failed",
            CaptureErrorCode::StartCreateFileFailed => "create_file_failed",
            CaptureErrorCode::RunCaptureDied => "capture_died",
            CaptureErrorCode::RunDiskFull => "disk_full",
            CaptureErrorCode::RunTimeout => "timeout",
            CaptureErrorCode::RunCancelled => "cancelled",
            CaptureErrorCode::RunProcessDied => "target_process_died",
            CaptureErrorCode::CleanCompressFailed => "compress_failed",
            CaptureErrorCode::CleanDeleteFailed => "delete_failed",
            CaptureErrorCode::CleanDiskFull => "cleanup_disk_full",
        }
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CaptureErrorCode::None.code(), 0);
        assert_eq!(CaptureErrorCode::Unknown.code(), 1);
        assert_eq!(CaptureErrorCode::StartInvalidParams.code(), 100);
        assert_eq!(CaptureErrorCode::StartCaptureFailed.code(), 104);
        assert_eq!(CaptureErrorCode::StartCreateFileFailed.code(), 105);
        assert_eq!(CaptureErrorCode::RunCaptureDied.code(), 200);
        assert_eq!(CaptureErrorCode::RunCancelled.code(), 203);
        assert_eq!(CaptureErrorCode::CleanCompressFailed.code(), 300);
        assert_eq!(CaptureErrorCode::CleanDiskFull.code(), 302);
    }
}
