pub mod types;

use libc::c_char;

use types::*;

#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    /// https://developer.apple.com/documentation/coreservices/1443980-fseventstreamcreate?language=objc
    pub fn FSEventStreamCreate(
        allocator: CFAllocatorRef,
        callback: FSEventStreamCallback,
        context: *const FSEventStreamContext,
        pathsToWatch: CFArrayRef,
        sinceWhen: FSEventStreamId,
        latency: CFTimeInterval,
        flags: FSEventStreamCreateFlags,
    ) -> FSEventStreamRef;

    pub fn FSEventStreamSetDispatchQueue(streamRef: FSEventStreamRef, q: dispatch_queue_t);

    /// https://developer.apple.com/documentation/coreservices/1448000-fseventstreamstart?language=objc
    pub fn FSEventStreamStart(streamRef: FSEventStreamRef) -> Boolean;

    /// https://developer.apple.com/documentation/coreservices/1447673-fseventstreamstop?language=objc
    pub fn FSEventStreamStop(streamRef: FSEventStreamRef);

    /// https://developer.apple.com/documentation/coreservices/1446990-fseventstreaminvalidate?language=objc
    pub fn FSEventStreamInvalidate(streamRef: FSEventStreamRef);

    /// https://developer.apple.com/documentation/coreservices/1445989-fseventstreamrelease?language=objc
    pub fn FSEventStreamRelease(streamRef: FSEventStreamRef);
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    pub static kCFTypeArrayCallBacks: CFArrayCallBacks;

    /// https://developer.apple.com/documentation/dispatch/1453030-dispatch_queue_create/
    pub fn dispatch_queue_create(
        label: *const c_char,
        attr: dispatch_queue_attr_t,
    ) -> dispatch_queue_t;

    /// https://developer.apple.com/documentation/dispatch/1496328-dispatch_release
    pub fn dispatch_release(object: dispatch_queue_t);

    pub fn CFArrayCreateMutable(
        allocator: CFAllocatorRef,
        capacity: CFIndex,
        callbacks: *const CFArrayCallBacks,
    ) -> CFMutableArrayRef;

    pub fn CFArrayAppendValue(array: CFMutableArrayRef, element: CFRef);

    pub fn CFStringCreateWithBytes(
        allocator: CFAllocatorRef,
        bytes: *const u8,
        numBytes: CFIndex,
        encoding: CFStringEncoding,
        isExternalRepresentation: Boolean,
    ) -> CFStringRef;

    pub fn CFRelease(res: CFRef);
}

/// Builds a one-element `CFArray` holding `path`. Returns null on failure.
///
/// # Safety
///
/// The returned array must be released with [`CFRelease`].
pub unsafe fn path_array(path: &str) -> CFMutableArrayRef {
    let paths = CFArrayCreateMutable(kCFAllocatorDefault, 0, &kCFTypeArrayCallBacks);
    if paths.is_null() {
        return paths;
    }

    let cf_path = CFStringCreateWithBytes(
        kCFAllocatorDefault,
        path.as_ptr(),
        path.len() as CFIndex,
        kCFStringEncodingUTF8,
        false as Boolean,
    );
    if cf_path.is_null() {
        CFRelease(paths);
        return std::ptr::null_mut();
    }

    CFArrayAppendValue(paths, cf_path);
    CFRelease(cf_path);
    paths
}
