fn main() {
    std::process::exit(pa_jail::cli::run());
}
