fn main() {
    strip_fusion::cli::run();
}
