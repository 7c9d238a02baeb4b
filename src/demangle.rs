use symbolic_demangle::Demangle as _;
use symbolic_demangle::DemangleOptions;

/// Renders a symbol name for diagnostics, demangling C++/Rust names when --demangle is on.
pub(crate) fn display_name(name: &[u8], demangle: bool) -> String {
    let Ok(text) = std::str::from_utf8(name) else {
        return String::from_utf8_lossy(name).into_owned();
    };
    if demangle && (text.starts_with("_Z") || text.starts_with("_R")) {
        let symbol = symbolic_common::Name::from(text);
        if let Some(demangled) = symbol.demangle(DemangleOptions::complete()) {
            return demangled;
        }
    }
    text.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_pass_through() {
        assert_eq!(display_name(b"main", true), "main");
        assert_eq!(display_name(b"_Znot_a_real_mangling", false), "_Znot_a_real_mangling");
    }

    #[test]
    fn test_cxx_demangling() {
        assert_eq!(display_name(b"_Z3foov", true), "foo()");
    }
}
