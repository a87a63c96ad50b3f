//! Itanium C++ name demangling for schema output, mirroring the original
//! pass's `__cxa_demangle` call with a pack-aligned crate instead of FFI.

pub fn demangle(mangled: &str) -> String {
    match cpp_demangle::Symbol::new(mangled) {
        Ok(sym) => sym.to_string(),
        Err(_) => mangled.to_string(),
    }
}
