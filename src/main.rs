fn main() {
    if let Err(error) = run() {
        tern::error::report_error_and_exit(&error);
    }
}

fn run() -> tern::Result {
    let args = tern::Args::parse(std::env::args().skip(1))?;
    tern::run(&args)
}
