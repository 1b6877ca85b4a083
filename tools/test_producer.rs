//! Test Transaction Producer
//!
//! Appends synthetic transactions to JSON-lines shard files for pipeline
//! testing. Each user always lands on the same shard.

use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

const LEGIT_MCCS: &[&str] = &["5411", "5812", "5541", "5651", "5999", "7011"];
const SUSPICIOUS_MCCS: &[&str] = &["5732", "5541"];
const CITIES: &[&str] = &["Austin", "Denver", "Portland", "Boston", "Chicago", "Atlanta"];
const FAR_CITIES: &[&str] = &["Lagos", "Minsk", "Macau", "Reykjavik"];

#[derive(Parser, Debug)]
#[command(name = "test-producer", about = "Write synthetic transactions to shard files")]
struct Args {
    /// Directory holding shard-<id>.jsonl files
    #[arg(long, default_value = "data/shards")]
    shard_dir: PathBuf,

    /// Number of shards to spread users over
    #[arg(long, default_value_t = 4)]
    shards: u32,

    /// Transactions to write
    #[arg(long, default_value_t = 100)]
    count: u64,

    /// Distinct users
    #[arg(long, default_value_t = 20)]
    users: u32,

    /// Share of suspicious transactions
    #[arg(long, default_value_t = 0.1)]
    fraud_rate: f64,

    /// Share of malformed records (dead-letter traffic)
    #[arg(long, default_value_t = 0.02)]
    malformed_rate: f64,

    /// Share of transactions dated outside the hot window
    #[arg(long, default_value_t = 0.05)]
    archive_rate: f64,

    /// Pause between records
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

/// Wire format read by the pipeline
#[derive(Debug, Clone, Serialize)]
struct Transaction {
    transaction_id: String,
    amount: String,
    merchant_mcc: String,
    location: String,
    timestamp: String,
    user_id: String,
}

/// Stable spending profile of a synthetic user
struct UserProfile {
    user_id: String,
    home: &'static str,
    typical_amount: f64,
}

/// Transaction generator for testing
struct TransactionGenerator {
    rng: rand::rngs::ThreadRng,
    users: Vec<UserProfile>,
    transaction_counter: u64,
}

impl TransactionGenerator {
    fn new(user_count: u32) -> Self {
        let mut rng = rand::thread_rng();
        let users = (0..user_count.max(1))
            .map(|i| UserProfile {
                user_id: format!("user_{:04}", i),
                home: CITIES[rng.gen_range(0..CITIES.len())],
                typical_amount: rng.gen_range(20.0..120.0),
            })
            .collect();

        Self {
            rng,
            users,
            transaction_counter: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.transaction_counter += 1;
        format!("tx_{}_{:08}", Utc::now().timestamp(), self.transaction_counter)
    }

    fn pick_user(&mut self) -> usize {
        self.rng.gen_range(0..self.users.len())
    }

    /// Everyday purchase near the user's usual amount, at home
    fn generate_legitimate(&mut self, archived: bool) -> Transaction {
        let user = self.pick_user();
        let id = self.next_id();
        let spread = self.rng.gen_range(0.6..1.4);
        let profile = &self.users[user];
        let amount = profile.typical_amount * spread;
        let age = if archived {
            ChronoDuration::days(self.rng.gen_range(120..720))
        } else {
            ChronoDuration::minutes(self.rng.gen_range(0..600))
        };

        Transaction {
            transaction_id: id,
            amount: format!("{:.2}", amount),
            merchant_mcc: LEGIT_MCCS[self.rng.gen_range(0..LEGIT_MCCS.len())].to_string(),
            location: profile.home.to_string(),
            timestamp: (Utc::now() - age).to_rfc3339(),
            user_id: profile.user_id.clone(),
        }
    }

    /// Large electronics or gas purchase from a city the user never visits
    fn generate_suspicious(&mut self) -> Transaction {
        let user = self.pick_user();
        let id = self.next_id();
        let multiple = self.rng.gen_range(8.0..40.0);
        let mcc = SUSPICIOUS_MCCS[self.rng.gen_range(0..SUSPICIOUS_MCCS.len())];
        let city = FAR_CITIES[self.rng.gen_range(0..FAR_CITIES.len())];
        let profile = &self.users[user];

        Transaction {
            transaction_id: id,
            amount: format!("{:.2}", profile.typical_amount * multiple),
            merchant_mcc: mcc.to_string(),
            location: city.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            user_id: profile.user_id.clone(),
        }
    }

    /// A record the validator rejects, keyed to a user for sharding
    fn generate_malformed(&mut self) -> (String, String) {
        let idx = self.pick_user();
        let user = self.users[idx].user_id.clone();
        let id = self.next_id();
        let line = match self.rng.gen_range(0..4) {
            0 => serde_json::json!({ "amount": "10.00", "merchant_mcc": "5411", "user_id": user }),
            1 => serde_json::json!({ "transaction_id": id, "amount": "-5.00", "merchant_mcc": "5411",
                "timestamp": Utc::now().to_rfc3339(), "user_id": user }),
            2 => serde_json::json!({ "transaction_id": id, "amount": "10.00", "merchant_mcc": "54a1",
                "timestamp": Utc::now().to_rfc3339(), "user_id": user }),
            _ => serde_json::json!({ "transaction_id": id, "amount": "10.00", "merchant_mcc": "5411",
                "timestamp": "yesterday", "user_id": user }),
        };
        (user, line.to_string())
    }
}

/// Shard a user is pinned to
fn shard_for(user_id: &str, shards: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as u32
}

async fn append_line(dir: &Path, shard: u32, line: &str) -> anyhow::Result<()> {
    let path = dir.join(format!("shard-{}.jsonl", shard));
    let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        shard_dir = %args.shard_dir.display(),
        shards = args.shards,
        count = args.count,
        users = args.users,
        fraud_rate = args.fraud_rate,
        malformed_rate = args.malformed_rate,
        "Starting Test Transaction Producer"
    );

    tokio::fs::create_dir_all(&args.shard_dir).await?;

    let mut generator = TransactionGenerator::new(args.users);
    let mut rng = rand::thread_rng();
    let mut per_shard: HashMap<u32, u64> = HashMap::new();
    let (mut legitimate, mut suspicious, mut malformed) = (0u64, 0u64, 0u64);

    for i in 0..args.count {
        let roll: f64 = rng.gen();
        let (user_id, line) = if roll < args.malformed_rate {
            malformed += 1;
            generator.generate_malformed()
        } else if roll < args.malformed_rate + args.fraud_rate {
            suspicious += 1;
            let tx = generator.generate_suspicious();
            (tx.user_id.clone(), serde_json::to_string(&tx)?)
        } else {
            legitimate += 1;
            let tx = generator.generate_legitimate(rng.gen_bool(args.archive_rate.clamp(0.0, 1.0)));
            (tx.user_id.clone(), serde_json::to_string(&tx)?)
        };

        let shard = shard_for(&user_id, args.shards);
        append_line(&args.shard_dir, shard, &line).await?;
        *per_shard.entry(shard).or_insert(0) += 1;

        if (i + 1) % 100 == 0 {
            info!(
                "Wrote {}/{} transactions ({} legitimate, {} suspicious, {} malformed)",
                i + 1,
                args.count,
                legitimate,
                suspicious,
                malformed
            );
        }

        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    info!(
        per_shard = ?per_shard,
        "Completed! Wrote {} transactions ({} legitimate, {} suspicious, {} malformed)",
        args.count,
        legitimate,
        suspicious,
        malformed
    );

    Ok(())
}
