//! Logging setup and the bridge reply macros.

/// Initialise env_logger once; `RUST_LOG` controls the level.
pub fn init_logs() {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Convert an `FsError` result into a FUSE reply error, returning early.
/// `rep!(reply, v, expr)` binds the success value, `rep!(reply, expr)`
/// discards it.
#[macro_export]
macro_rules! rep {
    ($reply:expr, $val:ident, $res:expr) => {
        let $val = match $res {
            Ok(v) => v,
            Err(e) => {
                log::debug!("op failed: {}", e);
                $reply.error(e.errno());
                return;
            }
        };
    };
    ($reply:expr, $res:expr) => {
        match $res {
            Ok(_) => {}
            Err(e) => {
                log::debug!("op failed: {}", e);
                $reply.error(e.errno());
                return;
            }
        }
    };
}

/// Map an `FsError` result to the `Result<(), c_int>` that `init` wants.
pub fn ret<T>(res: crate::cryptfs_lib::error::Result<T>) -> Result<(), libc::c_int> {
    match res {
        Ok(_) => Ok(()),
        Err(e) => Err(e.errno()),
    }
}
