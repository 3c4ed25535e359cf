use anyhow::anyhow;
use chrono::{Duration, Utc};
use clap::Parser;
use const_format::concatcp;
use rand::{seq::SliceRandom, Rng};
use reqwest::{
    blocking::{Client, Response},
    redirect, StatusCode,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::ops::{AddAssign, Div};
use std::process::{self, Child, Command, Stdio};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

const LOCAL_PORT: u32 = 8374;
const LOCAL_URL: &str = concatcp!("http://127.0.0.1:", LOCAL_PORT);

const LOCAL_ADMIN_USERNAME: &str = "benchmark-admin";
const LOCAL_ADMIN_PASSWORD: &str = "insecure";

#[rustfmt::skip]
const ROCKET_ENV: &[(&str, &str)] = &[
    ("ROCKET_PORT", concatcp!(LOCAL_PORT)),
    ("ROCKET_JWT_SECRET", "dummy"),
    ("ROCKET_ADMIN_USERNAME", LOCAL_ADMIN_USERNAME),
    ("ROCKET_VOTER_TRACKING", "true"),
];

#[rustfmt::skip]
const CHOICES: &[&str] = &[
    "Red",
    "Orange",
    "Yellow",
    "Green",
    "Blue",
    "Indigo",
    "Violet",
];

#[derive(Parser)]
struct Args {
    /// Silence local server logging.
    #[arg(short, long)]
    quiet: bool,

    /// Send local server logging to this file; takes precedence over --quiet.
    #[arg(long)]
    logfile: Option<String>,

    /// Run the local server against this MongoDB replica set instead of in memory.
    #[arg(long)]
    db_uri: Option<String>,

    /// Connect to a remote server at this URL instead of running a local one.
    #[arg(long, requires = "admin_password")]
    remote: Option<String>,

    /// Admin username on the remote server.
    #[arg(long, default_value = LOCAL_ADMIN_USERNAME)]
    admin_username: String,

    /// Admin password on the remote server.
    #[arg(long)]
    admin_password: Option<String>,

    /// How many threads to use. Defaults to the number of logical CPUs.
    #[arg(long, default_value_t = num_cpus::get())]
    threads: usize,

    /// How many voters each thread plays.
    #[arg(long, default_value_t = 100)]
    voters_per_thread: usize,

    /// Have every voter try to vote a second time; the server must refuse it.
    #[arg(long)]
    double_vote: bool,
}

/// Construct a URL from segments.
macro_rules! url {
    ($($segment:expr),+) => {{
        std::path::PathBuf::from_iter([$($segment),+]).to_str().unwrap()
    }}
}

/// Build the server and work out its environment.
fn setup_deps(db_uri: Option<&str>) -> anyhow::Result<Vec<(String, String)>> {
    // Ensure the optimised build is up-to-date.
    Command::new("cargo")
        .args(["build", "--release", "--bin", "ballotbox-backend"])
        .status()?
        .success()
        .then_some(())
        .ok_or_else(|| anyhow!("server build exited nonzero"))?;

    let mut salt = [0_u8; 16];
    rand::thread_rng().fill(&mut salt);
    let password_hash = argon2::hash_encoded(
        LOCAL_ADMIN_PASSWORD.as_bytes(),
        &salt,
        &argon2::Config::default(),
    )?;

    let mut env: Vec<(String, String)> = ROCKET_ENV
        .iter()
        .map(|(var, val)| (var.to_string(), val.to_string()))
        .collect();
    env.push(("ROCKET_ADMIN_PASSWORD_HASH".to_string(), password_hash));
    match db_uri {
        Some(uri) => {
            env.push(("ROCKET_STORAGE".to_string(), "mongodb".to_string()));
            env.push(("ROCKET_DB_URI".to_string(), uri.to_string()));
            env.push((
                "ROCKET_DB_NAME".to_string(),
                format!("benchmark{}", rand::random::<u32>()),
            ));
        }
        None => env.push(("ROCKET_STORAGE".to_string(), "memory".to_string())),
    }
    Ok(env)
}

/// Terminate the given child process. This is a SIGTERM on unix and a hard-kill on other
/// platforms.
fn terminate_child(child: &mut Child) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM)?;
    }
    #[cfg(not(unix))]
    {
        child.kill()?;
    }
    Ok(())
}

/// Start the server and wait until it answers.
fn launch_server(env: Vec<(String, String)>, logfile: Stdio) -> anyhow::Result<Child> {
    let mut proc = Command::new("./target/release/ballotbox-backend")
        .envs(env)
        .stdout(logfile)
        .spawn()?;

    // Wait for the server to be reachable.
    let client = Client::new();
    loop {
        let resp = client
            .get(url!(LOCAL_URL, "questions"))
            .send()
            .and_then(Response::error_for_status);

        if resp.is_ok() {
            break;
        }

        // Check the server didn't exit.
        if let Some(retcode) = proc.try_wait()? {
            return Err(anyhow!("Server exited prematurely with code {}", retcode));
        }
        thread::sleep(StdDuration::from_millis(100));
    }

    Ok(proc)
}

/// A client that keeps cookies and doesn't follow the post-vote redirect.
fn session_client() -> anyhow::Result<Client> {
    Ok(Client::builder()
        .cookie_store(true)
        .redirect(redirect::Policy::none())
        .build()?)
}

#[derive(Deserialize)]
struct ChoiceView {
    id: u32,
    text: String,
}

/// A question to benchmark against.
#[derive(Deserialize)]
struct QuestionDetail {
    id: u32,
    choices: Vec<ChoiceView>,
}

/// Create a question to benchmark against.
fn setup_question(url: &str, username: &str, password: &str) -> anyhow::Result<QuestionDetail> {
    let client = session_client()?;

    // Authenticate as admin.
    let creds = json!({
        "username": username,
        "password": password,
    });
    client
        .post(url!(url, "auth/admin"))
        .json(&creds)
        .send()
        .and_then(Response::error_for_status)?;

    // Create the question, open for the next two hours.
    let question = json!({
        "text": "Benchmark Question",
        "publish_at": Utc::now() - Duration::minutes(1),
        "close_at": Utc::now() + Duration::hours(2),
        "choices": CHOICES,
    });
    let detail = client
        .post(url!(url, "admin/questions"))
        .json(&question)
        .send()
        .and_then(Response::error_for_status)?
        .json()?;
    Ok(detail)
}

/// Durations of each part of the voting process.
#[derive(Debug, Default, Clone, Copy)]
struct VoteTimings {
    session: StdDuration,
    cast: StdDuration,
}

impl AddAssign for VoteTimings {
    fn add_assign(&mut self, rhs: Self) {
        self.session += rhs.session;
        self.cast += rhs.cast;
    }
}

impl Div<u32> for VoteTimings {
    type Output = Self;

    fn div(self, rhs: u32) -> Self {
        Self {
            session: self.session / rhs,
            cast: self.cast / rhs,
        }
    }
}

/// Play one voter: start a session and vote for a random choice.
/// Returns the ID of the choice voted for.
fn vote_once(
    url: &str,
    question: &QuestionDetail,
    double_vote: bool,
) -> anyhow::Result<(u32, VoteTimings)> {
    let client = session_client()?;
    let qid = question.id.to_string();

    let pre_session = Instant::now();
    client
        .post(url!(url, "auth/voter"))
        .send()
        .and_then(Response::error_for_status)?;
    let session = pre_session.elapsed();

    let choice = question
        .choices
        .choose(&mut rand::thread_rng())
        .ok_or_else(|| anyhow!("question has no choices"))?;
    let pre_cast = Instant::now();
    let resp = client
        .post(url!(url, "questions", &qid, "vote"))
        .form(&[("choice", choice.id.to_string())])
        .send()?;
    let cast = pre_cast.elapsed();
    if resp.status() != StatusCode::SEE_OTHER {
        return Err(anyhow!("vote was not accepted: {}", resp.status()));
    }

    if double_vote {
        let resp = client
            .post(url!(url, "questions", &qid, "vote"))
            .form(&[("choice", choice.id.to_string())])
            .send()?;
        if resp.status() != StatusCode::CONFLICT {
            return Err(anyhow!("second vote answered {}", resp.status()));
        }
    }

    Ok((choice.id, VoteTimings { session, cast }))
}

/// Run the benchmark, returning how many votes were accepted for each choice.
fn benchmark(
    url: &str,
    question: &QuestionDetail,
    num_threads: usize,
    voters_per_thread: usize,
    double_vote: bool,
) -> anyhow::Result<HashMap<u32, u64>> {
    let total_voters = num_threads * voters_per_thread;

    let start = Instant::now();
    thread::scope(|s| {
        let threads: Vec<_> = (0..num_threads)
            .map(|_| {
                s.spawn(move || {
                    let mut timings = VoteTimings::default();
                    let mut counts: HashMap<u32, u64> = HashMap::new();
                    for _ in 0..voters_per_thread {
                        let (choice, vote_timings) = vote_once(url, question, double_vote)?;
                        *counts.entry(choice).or_default() += 1;
                        timings += vote_timings;
                    }
                    Ok::<_, anyhow::Error>((counts, timings / voters_per_thread as u32))
                })
            })
            .collect();

        let mut counts: HashMap<u32, u64> = HashMap::new();
        let mut timings = VoteTimings::default();
        for t in threads {
            let (thread_counts, thread_timings) = t
                .join()
                .map_err(|_| anyhow!("voter thread panicked"))??;
            for (choice, n) in thread_counts {
                *counts.entry(choice).or_default() += n;
            }
            timings += thread_timings;
        }
        let total_duration = start.elapsed();

        let avg = timings / num_threads as u32;
        let avg_total = avg.session + avg.cast;

        // Theoretical votes per sec is 1/avg_duration * num_threads.
        let votes_per_sec = num_threads as f64 / avg_total.as_secs_f64();
        // Actual votes per sec is total_votes / total_time.
        let actual_votes_per_sec = total_voters as f64 / total_duration.as_secs_f64();

        println!("session: {:?}", avg.session);
        println!("cast:    {:?}", avg.cast);

        println!("\ntotal: {:?} ({:.2}/s)", avg_total, votes_per_sec);
        println!(
            "actual duration: {} votes in {:?} ({:.2}/s)",
            total_voters, total_duration, actual_votes_per_sec
        );

        Ok(counts)
    })
}

#[derive(Deserialize)]
struct ChoiceCount {
    choice_id: u32,
    votes: u64,
}

#[derive(Deserialize)]
struct Tally {
    counts: Vec<ChoiceCount>,
    total_votes: u64,
}

#[derive(Deserialize)]
struct QuestionResults {
    tally: Tally,
}

/// Return `Ok(())` if the server's tally matches the votes we had accepted.
fn verify(url: &str, question: &QuestionDetail, expected: &HashMap<u32, u64>) -> anyhow::Result<()> {
    let results: QuestionResults = Client::new()
        .get(url!(url, "questions", &question.id.to_string(), "results"))
        .send()
        .and_then(Response::error_for_status)?
        .json()?;

    let accepted: u64 = expected.values().sum();
    if results.tally.total_votes != accepted {
        return Err(anyhow!(
            "server counted {} votes but accepted {}",
            results.tally.total_votes,
            accepted
        ));
    }
    for count in &results.tally.counts {
        let want = expected.get(&count.choice_id).copied().unwrap_or(0);
        if count.votes != want {
            let text = question
                .choices
                .iter()
                .find(|c| c.id == count.choice_id)
                .map_or("?", |c| c.text.as_str());
            return Err(anyhow!(
                "choice {text} has {} votes, expected {want}",
                count.votes
            ));
        }
    }
    println!("verified: {accepted} votes, no lost updates");
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let url = args.remote.as_deref().unwrap_or(LOCAL_URL);
    let password = args
        .admin_password
        .as_deref()
        .unwrap_or(LOCAL_ADMIN_PASSWORD);

    // If we're not connecting remotely, bring up a local server.
    let mut proc: Option<Child> = None;
    if args.remote.is_none() {
        let env = setup_deps(args.db_uri.as_deref())?;
        let logfile = match args.logfile {
            Some(path) => Stdio::from(File::create(path)?),
            None => {
                if args.quiet {
                    Stdio::null()
                } else {
                    Stdio::inherit()
                }
            }
        };
        proc = Some(launch_server(env, logfile)?);
    }

    // Use a closure to ensure the cleanup below runs.
    let result = (|| {
        let question = setup_question(url, &args.admin_username, password)?;
        let counts = benchmark(
            url,
            &question,
            args.threads,
            args.voters_per_thread,
            args.double_vote,
        )?;
        verify(url, &question, &counts)
    })();

    // Kill the server.
    if let Some(p) = proc.as_mut() {
        terminate_child(p)?;
        p.wait()?;
    }

    result
}

fn main() {
    if let Err(e) = run() {
        eprintln!("FATAL: {}", e);
        process::exit(1);
    }
}
