fn main() {
    if let Err(e) = gatescan_lib::run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
