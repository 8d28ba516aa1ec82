//! Kernel constants.
//!
//! Virtual path grammar and lock protocol timings.

use std::time::Duration;

/// Path separator.
pub const SEPARATOR: char = '/';

/// Prefix of cell-qualified paths: `/galaxy/<cell>-d/<rest>`.
pub const CELL_PREFIX: &str = "/galaxy";

/// Suffix that terminates the cell segment of a cell-qualified path.
pub const CELL_SUFFIX: &str = "-d";

/// Prefix of paths local to the executing cell: `/LOCAL/<rest>`.
pub const LOCAL_PREFIX: &str = "/LOCAL";

/// Prefix of paths broadcast to every active cell: `/SHARED/<rest>`.
pub const SHARED_PREFIX: &str = "/SHARED";

/// Lock marker suffix; markers are named `.{basename}.lock`.
pub const LOCK_SUFFIX: &str = ".lock";

/// Pause between lock acquisition attempts.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Lease written into a fresh lock marker. A holder that outlives it may
/// have its marker reclaimed by a contender.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(300);

/// Give up acquiring a lock after this long.
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default deadline for one remote call.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(30);

/// Default frame limit when a cell does not configure `fs_max_msg_size`.
pub const DEFAULT_MAX_MESSAGE_SIZE_MB: usize = 64;

/// Default permission bits for created directories.
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// Default permission bits for created files.
pub const DEFAULT_FILE_MODE: u32 = 0o777;

/// Environment variable naming the cell a process runs in.
pub const ENV_CELL: &str = "CELLFS_CELL";

/// Environment variable giving the `/LOCAL/` root outside any cell.
pub const ENV_LOCAL_ROOT: &str = "CELLFS_LOCAL_ROOT";

/// Environment variable pointing at the global cell configuration.
pub const ENV_CONFIG: &str = "CELLFS_CONFIG";
