use std::path::Path;

use crate::{platforms::NativeBackend, ChangeEvent, WatchError, WatchOptions};

/// Stands in on targets without a native change API. Watchers never open it
/// there, since they check support first.
pub struct UnsupportedBackend;

impl NativeBackend for UnsupportedBackend {
    fn open(_path: &Path, _options: &WatchOptions) -> Result<Self, WatchError> {
        Ok(UnsupportedBackend)
    }

    fn drain(&mut self, _sink: &mut dyn FnMut(ChangeEvent)) {}
}
