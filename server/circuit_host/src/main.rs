mod counter;

use circuit_runtime::CircuitFactory;
use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let builder = CircuitFactory::builder()
        .startup("/", counter::startup)
        .renderer(counter::renderer)
        .method("app", "CurrentLocation", counter::current_location)
        .method("app", "Echo", counter::echo);

    if let Err(err) = circuit_runtime::run(builder) {
        log::error!("circuit host fatal error: {err}");
        process::exit(1);
    }
}
