use anyhow::Result;
use clap::{Arg, Command};

use cronpool::common::{common_args, parse_app_mode, start_application, StartupConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("cronpool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式定时任务调度系统")
        .args(common_args())
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["scheduler", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID (默认 主机名-进程号)"),
        )
        .get_matches();

    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");
    let app_mode = parse_app_mode(mode_str)?;

    start_application(StartupConfig::from_matches(&matches), app_mode, "cronpool").await
}
