fn main() {
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();
    tiller::app::logging::init();
    if let Err(err) = tiller::app::cli::run() {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}
