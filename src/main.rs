fn main() {
    ethotrack_lib::run()
}
