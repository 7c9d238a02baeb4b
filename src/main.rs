fn main() {
    let linker = match mold::Linker::from_args(std::env::args().skip(1)) {
        Ok(linker) => linker,
        Err(error) => mold::error::report_error_and_exit(&error),
    };
    if let Err(error) = linker.run() {
        mold::error::report_error_and_exit(&error);
    }
}
