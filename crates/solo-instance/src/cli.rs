#[derive(clap::Parser)]
#[command(
    name = "solo-demo",
    version,
    about = "solo-demo",
    long_about = "Demo app for the single-instance coordinator: the first \
                  launch becomes the primary and prints every argument vector \
                  forwarded to it; later launches hand their arguments over \
                  and exit with the primary's result code"
)]
pub struct Args {
    #[arg(
        long,
        short = 'n',
        value_name = "APP_NAME",
        help = "Identity shared by all launches that should coordinate. \
                Example value: \"com.example.demo\"",
        default_value = "solo-demo"
    )]
    pub app_name: String,

    #[arg(
        long,
        value_name = "EXIT_CODE",
        help = "Exit code the callback returns for every invocation",
        default_value_t = 0
    )]
    pub exit_code: i32,

    #[arg(
        long,
        value_name = "HOLD_SECS",
        help = "Keep the primary alive this many seconds so secondaries have \
                something to marshal to"
    )]
    pub hold_secs: Option<u64>,

    #[arg(
        long,
        short = 'l',
        value_name = "LOG_PATH",
        help = "Optional log path. If not provided, logs go to \
                /tmp/solo-demo-$PID.log"
    )]
    pub log_path: Option<String>,

    #[arg(
        trailing_var_arg = true,
        value_name = "ARGS",
        help = "Arguments forwarded to the primary instance"
    )]
    pub forward: Vec<String>,
}
