fn main() {
    tensiometer_lib::run()
}
