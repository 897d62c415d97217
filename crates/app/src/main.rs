fn main() {
    if let Err(error) = hailoseg_app::run_from_env() {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}
