//! The crate prelude.

pub use crate::error::Errno::*;
pub use crate::error::{Errno, Error, Result};
pub use crate::os::{Arc, BTreeMap, Condvar, CvarMutex, Mutex, RwLock, RwSem};
pub use crate::return_errno_with_msg;

pub use core::fmt::{self, Debug};
pub use log::{debug, error, info, trace, warn};
