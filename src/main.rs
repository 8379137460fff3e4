fn main() {
    steamsieve::run();
}
