//! Client configuration constants.

use std::time::Duration;

/// Time allowed to open a TCP connection to a cell, within the call deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory under the user config dir holding the cell table.
pub const CONFIG_DIR_NAME: &str = "cellfs";

/// Cell table file name.
pub const CONFIG_FILE_NAME: &str = "cells.json";
