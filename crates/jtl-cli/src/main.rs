fn main() {
    if let Err(err) = jtl_cli::run_from_env() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
