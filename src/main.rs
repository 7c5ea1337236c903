use std::env;

const USAGE: &str = "Usage: nestplan serve [port] | nestplan project --current-age <AGE> --exit-age <AGE> [flags]";

#[tokio::main]
async fn main() {
    env_logger::init();

    let raw_args: Vec<String> = env::args().collect();
    match raw_args.get(1).map(|s| s.as_str()) {
        Some("serve") => {
            let port = raw_args
                .get(2)
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(8080);
            if let Err(e) = nestplan::api::run_http_server(port).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Some("project") => {
            let args = std::iter::once("nestplan project".to_string())
                .chain(raw_args.into_iter().skip(2));
            match nestplan::api::run_cli(args) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }
}
