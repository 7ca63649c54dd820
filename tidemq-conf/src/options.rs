use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(name = "tidemq", about = "Embeddable MQTT broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// TLS certificate chain (PEM), used by every TLS endpoint without its own
    #[structopt(long, default_value = "server.crt")]
    pub cert: String,

    /// TLS private key (PEM)
    #[structopt(long, default_value = "server.key")]
    pub key: String,

    /// Directory of the persistent store
    #[structopt(name = "store-dir", long, default_value = ".tidemq-store")]
    pub store_dir: String,

    ///Remove the store directory after a clean shutdown
    #[structopt(long)]
    pub ephemeral: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cfg_name: None,
            cert: "server.crt".into(),
            key: "server.key".into(),
            store_dir: ".tidemq-store".into(),
            ephemeral: false,
        }
    }
}
