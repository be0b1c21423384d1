fn main() {
    if let Err(err) = table_versioner::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
