//! settlement-engine CLI
//!
//! Operational commands over a JSON-file store.
//!
//! # Usage
//!
//! ```bash
//! # Inspect groups and their settlement status
//! settlement-engine list-groups
//!
//! # Process every due expiration and recurring settlement now
//! settlement-engine check-settlements
//!
//! # Make a recurring group due and settle it
//! settlement-engine set-settlement-date K3J9QX2M7A1B --days -1
//! settlement-engine test-settlement --dry-run
//!
//! # Exchange rates from USD, served from the rate cache when fresh
//! settlement-engine rates USD
//!
//! # Run the scheduler until stdin closes
//! settlement-engine run
//! ```

use chrono::{Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use rust_decimal::Decimal;
use settlement_engine::config::Settings;
use settlement_engine::context::Context;
use settlement_engine::core::actor::Actor;
use settlement_engine::core::currency::{format_amount_suffix, CurrencyCode};
use settlement_engine::core::expense::SplitType;
use settlement_engine::core::group::Group;
use settlement_engine::core::ids::{GroupId, ParticipantId};
use settlement_engine::fx::HttpRateProvider;
use settlement_engine::groups::{ExpenseInput, GroupService, NewGroup};
use settlement_engine::lifecycle::{SettlementManager, Transition};
use settlement_engine::notify::LogMailer;
use settlement_engine::scheduler::{JobKind, Scheduler, SchedulerConfig};
use settlement_engine::store::{MemoryStore, Store};
use std::error::Error;
use std::io::{self, BufRead};
use std::process;
use std::sync::Arc;

type CliResult<T = ()> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "settlement-engine")]
#[command(about = "Group expense splitting: balances, netting and scheduled settlements")]
struct Cli {
    /// Settings file, extension optional (also read from `SPLIT_CONFIG`).
    #[arg(long, env = "SPLIT_CONFIG")]
    config: Option<String>,

    /// JSON store file; overrides `data_file` from the settings.
    #[arg(long)]
    data_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all groups with settlement information
    ListGroups,
    /// Process due expirations and recurring settlements now
    CheckSettlements,
    /// Send reminders for settlements three days out
    SendReminders,
    /// Show scheduler jobs and their next run
    SchedulerStatus,
    /// Settle a specific group, or preview every due group
    TestSettlement(TestSettlementArgs),
    /// Move a recurring group's next settlement date (for testing)
    SetSettlementDate(ShiftDateArgs),
    /// Move a group's expiration date (for testing)
    SetExpirationDate(ShiftDateArgs),
    /// Show current balances and the suggested transfers
    Balances(BalancesArgs),
    CreateGroup(CreateGroupArgs),
    AddParticipant(AddParticipantArgs),
    AddExpense(AddExpenseArgs),
    /// Settle a group now, as its admin
    Settle(SettleArgs),
    /// Reopen a settled or expired group
    Reopen(TokenArg),
    /// Delete a group and everything in it
    Delete(DeleteArgs),
    /// Print the plain-text history export
    History(TokenArg),
    /// Print current exchange rates from one currency to the others
    Rates(RatesArgs),
    /// Run the scheduler until stdin is closed
    Run,
}

#[derive(Args, Debug)]
struct TestSettlementArgs {
    #[arg(long)]
    group_id: Option<u64>,
    /// Preview what would happen without making changes
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct ShiftDateArgs {
    share_token: String,
    /// Days from now (negative for the past)
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    days: i64,
}

#[derive(Args, Debug)]
struct TokenArg {
    share_token: String,
}

#[derive(Args, Debug)]
struct BalancesArgs {
    share_token: String,
    /// Display currency (defaults to the group currency)
    #[arg(long)]
    currency: Option<String>,
}

#[derive(Args, Debug)]
struct RatesArgs {
    #[arg(default_value = "EUR")]
    base: String,
}

#[derive(Args, Debug)]
struct CreateGroupArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    creator: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    currency: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Last day the group accepts expenses (YYYY-MM-DD)
    #[arg(long)]
    expires_on: Option<NaiveDate>,
    #[arg(long)]
    recurring: bool,
}

#[derive(Args, Debug)]
struct AddParticipantArgs {
    share_token: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: Option<String>,
}

#[derive(Args, Debug)]
struct AddExpenseArgs {
    share_token: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    amount: Decimal,
    /// Defaults to the group currency
    #[arg(long)]
    currency: Option<String>,
    /// Name of the participant who paid
    #[arg(long)]
    paid_by: String,
    /// Names to split between, comma separated (default: everyone)
    #[arg(long, value_delimiter = ',')]
    split: Vec<String>,
    /// Defaults to today
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Args, Debug)]
struct SettleArgs {
    share_token: String,
    /// Close the group instead of settling the current period
    #[arg(long)]
    r#final: bool,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    share_token: String,
    /// Required: deletion cannot be undone
    #[arg(long)]
    yes: bool,
}

struct App {
    settings: Settings,
    groups: GroupService,
    manager: Arc<SettlementManager>,
}

impl App {
    fn open(cli: &Cli) -> CliResult<Self> {
        let mut settings = Settings::load(cli.config.as_deref())?;
        if let Some(path) = &cli.data_file {
            settings.data_file = Some(path.clone());
        }
        let store: Arc<dyn Store> = match &settings.data_file {
            Some(path) => Arc::new(MemoryStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let provider = HttpRateProvider::new(settings.rates_api_url.clone())?;
        let ctx = Arc::new(
            Context::builder(Arc::new(provider))
                .settings(&settings)
                .store(store)
                .mailer(Arc::new(LogMailer))
                .build(),
        );
        Ok(Self {
            settings,
            groups: GroupService::new(Arc::clone(&ctx)),
            manager: Arc::new(SettlementManager::new(ctx)),
        })
    }

    fn ctx(&self) -> &Context {
        self.manager.context()
    }

    fn scheduler(&self) -> CliResult<Scheduler> {
        let config = SchedulerConfig::from_settings(&self.settings)?;
        Ok(Scheduler::new(Arc::clone(&self.manager), config))
    }

    fn participant_named(&self, group: GroupId, name: &str) -> CliResult<ParticipantId> {
        let tables = self.ctx().store.snapshot();
        tables
            .participants_of(group)
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
            .map(|p| p.id)
            .ok_or_else(|| format!("no participant named '{name}' in this group").into())
    }
}

fn rule() {
    println!("{}", "=".repeat(80));
}

fn cmd_list_groups(app: &App) {
    rule();
    println!("ALL GROUPS");
    rule();
    let tables = app.ctx().store.snapshot();
    let groups: Vec<&Group> = tables.groups().collect();
    if groups.is_empty() {
        println!("No groups found.");
        return;
    }
    let now = app.ctx().now();
    println!("Current UTC time: {}", now.to_rfc3339());
    println!();
    for group in groups {
        println!("Group: {} ({}) - {}", group.name, group.id, group.status_label(now));
        println!("  Share Token: {}", group.share_token);
        println!("  Active: {}", group.is_active);
        println!("  Settled: {}", group.is_settled);
        println!("  Recurring: {}", group.is_recurring);
        if let Some(at) = group.expires_at {
            let state = if group.is_expired(now) { "(EXPIRED)" } else { "(future)" };
            println!("  Expires At: {} {}", at.to_rfc3339(), state);
        }
        if let Some(at) = group.next_settlement_date {
            let state = if at <= now { "(DUE NOW)" } else { "(pending)" };
            println!("  Next Settlement: {} {}", at.to_rfc3339(), state);
        }
        println!("  Active Expenses: {}", tables.active_expenses_of(group.id).len());
        println!("  Participants: {}", tables.participants_of(group.id).len());
        println!();
    }
}

fn cmd_test_settlement(app: &App, args: &TestSettlementArgs) -> CliResult {
    rule();
    println!("SETTLEMENT TEST{}", if args.dry_run { " (DRY RUN)" } else { "" });
    rule();
    let now = app.ctx().now();
    println!("Current UTC time: {}", now.to_rfc3339());
    println!();

    let tables = app.ctx().store.snapshot();
    let candidates: Vec<(bool, Group)> = match args.group_id {
        Some(id) => {
            let group = tables.require_group(GroupId::new(id))?.clone();
            vec![(group.is_expired(now), group)]
        }
        None => {
            let expired = tables.groups().filter(|g| g.is_active && g.is_expired(now));
            let recurring = tables.groups().filter(|g| g.is_settlement_due(now) && !g.is_expired(now));
            expired
                .map(|g| (true, g.clone()))
                .chain(recurring.map(|g| (false, g.clone())))
                .collect()
        }
    };
    if candidates.is_empty() {
        println!("No groups due for settlement.");
        return Ok(());
    }

    for (expired, group) in candidates {
        let kind = if expired { "expired" } else { "recurring" };
        println!("Testing {} settlement for: {} ({})", kind, group.name, group.id);
        println!("  Active: {}", group.is_active);
        println!("  Recurring: {}", group.is_recurring);
        println!("  Active expenses: {}", tables.active_expenses_of(group.id).len());
        println!("  Participants: {}", tables.participants_of(group.id).len());
        if args.dry_run {
            println!("  [DRY RUN] Would process {kind} settlement");
        } else {
            let result = if expired {
                app.manager.process_expiration(group.id)
            } else {
                app.manager.auto_settle(group.id)
            };
            match result {
                Ok(Transition::Applied(outcome)) => {
                    println!("  ✓ Successfully processed {kind} settlement");
                    println!("{outcome}");
                }
                Ok(Transition::Unchanged(reason)) => println!("  - Nothing to do: {reason}"),
                Err(e) => println!("  ✗ Error processing settlement: {e}"),
            }
        }
        println!();
    }
    Ok(())
}

fn cmd_shift_date(app: &App, args: &ShiftDateArgs, expiration: bool) -> CliResult {
    let group = app.groups.group_by_share_token(&args.share_token)?;
    let now = app.ctx().now();
    let target = now + Duration::days(args.days);
    if expiration {
        app.manager.force_expiration_date(group.id, target)?;
        println!("✓ Updated expiration date for '{}' to: {}", group.name, target.to_rfc3339());
    } else {
        app.manager.force_settlement_date(group.id, target)?;
        println!("✓ Updated next settlement date for '{}' to: {}", group.name, target.to_rfc3339());
    }
    println!("  Current time: {}", now.to_rfc3339());
    if args.days <= 0 {
        let state = if expiration { "Group is now EXPIRED" } else { "Settlement is now DUE" };
        println!("  {state} - run 'settlement-engine check-settlements' to process");
    }
    Ok(())
}

fn cmd_balances(app: &App, args: &BalancesArgs) -> CliResult {
    let group = app.groups.group_by_share_token(&args.share_token)?;
    let display = args.currency.as_deref().map(CurrencyCode::supported).transpose()?;
    let ledger = app.groups.balances(group.id, display.as_ref())?;
    let tables = app.ctx().store.snapshot();
    println!("=== Balances: {} ({}) ===", group.name, ledger.currency());
    for p in tables.participants_of(group.id) {
        println!("  {:<24} {:>14}", p.name, format_amount_suffix(ledger.position(p.id), ledger.currency()));
    }
    println!();
    print!("{}", app.groups.settlement_plan(group.id)?);
    Ok(())
}

fn cmd_rates(app: &App, args: &RatesArgs) -> CliResult {
    let base = CurrencyCode::supported(&args.base)?;
    let rates = app.ctx().converter.latest_rates(&base);
    println!("=== Exchange rates: 1 {base} ===");
    if rates.is_empty() {
        println!("No rates available");
    }
    for (quote, rate) in &rates {
        println!("  {quote}  {rate}");
    }
    Ok(())
}

fn cmd_create_group(app: &App, args: &CreateGroupArgs) -> CliResult {
    let created = app.groups.create_group(NewGroup {
        name: args.name.clone(),
        description: args.description.clone(),
        currency: args.currency.clone().unwrap_or_else(|| app.settings.default_currency.clone()),
        creator_name: args.creator.clone(),
        creator_email: args.email.clone(),
        expires_on: args.expires_on,
        recurring: args.recurring,
    })?;
    let links = app.settings.links();
    println!("✓ Created '{}' ({})", created.group.name, created.group.id);
    println!("  Share link: {}", links.group(&created.group.share_token));
    println!("  Admin link: {}", links.admin(&created.group.share_token, &created.group.admin_token));
    if let Some(next) = created.group.next_settlement_date {
        println!("  Next settlement: {}", next.to_rfc3339());
    }
    Ok(())
}

fn cmd_add_participant(app: &App, args: &AddParticipantArgs) -> CliResult {
    let group = app.groups.group_by_share_token(&args.share_token)?;
    let p = app.groups.add_participant(group.id, &Actor::Admin, &args.name, args.email.as_deref())?;
    println!("✓ Added {} to '{}'", p.name, group.name);
    println!("  Personal link: {}", app.settings.links().participant(&group.share_token, &p.access_token));
    Ok(())
}

fn cmd_add_expense(app: &App, args: &AddExpenseArgs) -> CliResult {
    let group = app.groups.group_by_share_token(&args.share_token)?;
    let paid_by = app.participant_named(group.id, &args.paid_by)?;
    let split_between = args
        .split
        .iter()
        .map(|name| app.participant_named(group.id, name))
        .collect::<CliResult<Vec<_>>>()?;
    let expense = app.groups.add_expense(
        group.id,
        &Actor::Admin,
        ExpenseInput {
            title: args.title.clone(),
            amount: args.amount,
            currency: args.currency.clone().unwrap_or_else(|| group.currency.to_string()),
            paid_by,
            date: args.date.unwrap_or_else(|| Utc::now().date_naive()),
            split_type: SplitType::Equal,
            split_between,
        },
    )?;
    println!(
        "✓ Added '{}' ({}) as {}",
        expense.title,
        format_amount_suffix(expense.amount, &group.currency),
        expense.id
    );
    Ok(())
}

fn cmd_settle(app: &App, args: &SettleArgs) -> CliResult {
    let group = app.groups.group_by_share_token(&args.share_token)?;
    if args.r#final {
        println!("{}", app.manager.settle_final(group.id, &Actor::Admin)?);
        return Ok(());
    }
    match app.manager.settle_period(group.id, &Actor::Admin)? {
        Transition::Applied(outcome) => println!("{outcome}"),
        Transition::Unchanged(reason) => println!("Nothing to settle: {reason}"),
    }
    Ok(())
}

fn cmd_reopen(app: &App, args: &TokenArg) -> CliResult {
    let group = app.groups.group_by_share_token(&args.share_token)?;
    match app.manager.reopen(group.id, &Actor::Admin)? {
        Transition::Applied(outcome) => {
            println!("✓ Reopened '{}'", group.name);
            if outcome.expiration_removed {
                println!("  Expiration date removed");
            }
        }
        Transition::Unchanged(reason) => println!("{reason}"),
    }
    Ok(())
}

fn cmd_delete(app: &App, args: &DeleteArgs) -> CliResult {
    if !args.yes {
        return Err("deletion cannot be undone; pass --yes to confirm".into());
    }
    let group = app.groups.group_by_share_token(&args.share_token)?;
    println!("{}", app.manager.delete(group.id, &Actor::Admin)?);
    Ok(())
}

fn cmd_run(app: &App) -> CliResult {
    let scheduler = app.scheduler()?;
    scheduler.start()?;
    println!("{}", scheduler.status());
    println!();
    println!("Scheduler running. Close stdin (Ctrl-D) to stop.");
    for line in io::stdin().lock().lines() {
        match line?.trim() {
            "status" => println!("{}", scheduler.status()),
            "check" => {
                if let Some(report) = scheduler.trigger(JobKind::SettlementCheck) {
                    println!("{report}");
                }
            }
            _ => {}
        }
    }
    scheduler.stop();
    info!("stdin closed, exiting");
    Ok(())
}

fn run(cli: Cli) -> CliResult {
    let app = App::open(&cli)?;
    match &cli.command {
        Command::ListGroups => cmd_list_groups(&app),
        Command::CheckSettlements => {
            println!("Checking for due settlements...");
            if let Some(report) = app.scheduler()?.trigger(JobKind::SettlementCheck) {
                println!("{report}");
            }
            println!("Settlement check completed.");
        }
        Command::SendReminders => {
            if let Some(report) = app.scheduler()?.trigger(JobKind::ReminderCheck) {
                println!("{report}");
            }
        }
        Command::SchedulerStatus => println!("{}", app.scheduler()?.status()),
        Command::TestSettlement(args) => cmd_test_settlement(&app, args)?,
        Command::SetSettlementDate(args) => cmd_shift_date(&app, args, false)?,
        Command::SetExpirationDate(args) => cmd_shift_date(&app, args, true)?,
        Command::Balances(args) => cmd_balances(&app, args)?,
        Command::CreateGroup(args) => cmd_create_group(&app, args)?,
        Command::AddParticipant(args) => cmd_add_participant(&app, args)?,
        Command::AddExpense(args) => cmd_add_expense(&app, args)?,
        Command::Settle(args) => cmd_settle(&app, args)?,
        Command::Reopen(args) => cmd_reopen(&app, args)?,
        Command::Delete(args) => cmd_delete(&app, args)?,
        Command::History(args) => {
            let group = app.groups.group_by_share_token(&args.share_token)?;
            println!("{}", app.groups.history_text(group.id)?);
        }
        Command::Rates(args) => cmd_rates(&app, args)?,
        Command::Run => cmd_run(&app)?,
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
