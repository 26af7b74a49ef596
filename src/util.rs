//! Small helpers for talking to Vulkan.

use std::{
    borrow::Cow,
    ffi::CStr,
    fmt,
    os::raw::c_char,
};

use ash::vk;

const NAME_SIZE: usize = vk::MAX_EXTENSION_NAME_SIZE;

/// A layer or extension name, stored inline the way Vulkan hands them out.
///
/// Comparison and hashing only look at the bytes up to the first nul, so
/// names read back from the driver compare equal to ones written by hand.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct VkExtensionName([c_char; NAME_SIZE]);

impl VkExtensionName {
    /// Build a name from bytes, stopping at the first nul. Usable in consts.
    pub(crate) const fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = [0; NAME_SIZE];
        let mut i = 0;
        while i < bytes.len() && i < NAME_SIZE - 1 && bytes[i] != 0 {
            name[i] = bytes[i] as c_char;
            i += 1;
        }
        Self(name)
    }

    pub(crate) fn from_cstr(name: &CStr) -> Self {
        Self::from_bytes(name.to_bytes())
    }

    /// Pointer to the nul-terminated name, valid for as long as `self` is.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *const c_char {
        self.0.as_ptr()
    }

    pub(crate) fn as_cstr(&self) -> &CStr {
        // SAFETY: the last byte is always nul.
        unsafe { CStr::from_ptr(self.as_ptr()) }
    }

    pub(crate) fn to_string_lossy(&self) -> Cow<'_, str> {
        self.as_cstr().to_string_lossy()
    }
}

impl From<[c_char; NAME_SIZE]> for VkExtensionName {
    fn from(raw: [c_char; NAME_SIZE]) -> Self {
        let mut name = [0; NAME_SIZE];
        raw.iter()
            .take(NAME_SIZE - 1)
            .take_while(|c| **c != 0)
            .zip(name.iter_mut())
            .for_each(|(src, dst)| *dst = *src);
        Self(name)
    }
}

impl fmt::Debug for VkExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_cstr())
    }
}

impl fmt::Display for VkExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_from_the_driver_match_names_from_literals() {
        let literal = VkExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation\0");

        let mut raw = [0x55 as c_char; NAME_SIZE];
        for (dst, src) in raw.iter_mut().zip(b"VK_LAYER_KHRONOS_validation\0") {
            *dst = *src as c_char;
        }

        assert_eq!(VkExtensionName::from(raw), literal);
        assert_eq!(literal.to_string(), "VK_LAYER_KHRONOS_validation");
    }
}
