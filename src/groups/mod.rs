//! Group, participant and expense operations.
//!
//! These are the mutations that feed the balance engine. Each one runs in
//! a single transaction, writes one audit entry, and pushes real-time
//! updates to the group's room after commit.

pub mod history;

use crate::context::Context;
use crate::core::actor::{Actor, Credential};
use crate::core::audit::{AuditAction, NewAuditEntry};
use crate::core::currency::{format_amount, round_half_up, round_money, CurrencyCode};
use crate::core::expense::{Expense, ExpenseShare, SplitType};
use crate::core::group::{participant_color, Group, GroupState, Participant};
use crate::core::ids::{ExpenseId, GroupId, ParticipantId, PaymentId};
use crate::core::ledger::{Ledger, NOISE_FLOOR};
use crate::core::notification::NotificationKind;
use crate::error::{Error, Result};
use crate::lifecycle::dates::{end_of_day, first_settlement_date};
use crate::lifecycle::Transition;
use crate::notify::report;
use crate::notify::{BroadcastEvent, DeliveryOutcome, NotificationRequest};
use crate::optimization::{BalanceEngine, NettingEngine, SettlementPlan};
use crate::store::{StoreError, Tables};
use crate::tokens::{RandomTokens, TokenGenerator};
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;

/// Attempts made when a freshly generated token collides.
pub const CREATE_ATTEMPTS: usize = 3;

/// Input for [`GroupService::create_group`].
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub creator_name: String,
    pub creator_email: Option<String>,
    /// Last day the group accepts expenses; it expires at the end of it.
    pub expires_on: Option<NaiveDate>,
    pub recurring: bool,
}

/// A created group, its admin participant, and the confirmation email
/// outcome when the creator gave an address.
#[derive(Debug, Clone)]
pub struct CreatedGroup {
    pub group: Group,
    pub creator: Participant,
    pub confirmation: Option<DeliveryOutcome>,
}

/// Input for adding or editing an expense.
#[derive(Debug, Clone)]
pub struct ExpenseInput {
    pub title: String,
    pub amount: Decimal,
    /// Currency `amount` is given in; converted into the group currency.
    pub currency: String,
    pub paid_by: ParticipantId,
    pub date: NaiveDate,
    pub split_type: SplitType,
    /// Share holders. Empty means everyone in the group.
    pub split_between: Vec<ParticipantId>,
}

/// An expense amount after conversion into the group currency.
struct Converted {
    amount: Decimal,
    original_amount: Decimal,
    currency: CurrencyCode,
    exchange_rate: Decimal,
}

fn conflict(err: &Error) -> bool {
    matches!(err, Error::Store(StoreError::Conflict(_)))
}

/// Reject changes to a group that no longer accepts them.
fn ensure_open(group: &Group, now: DateTime<Utc>) -> Result<()> {
    match group.state(now) {
        GroupState::Open | GroupState::PeriodSettled => Ok(()),
        GroupState::FinalSettled => Err(Error::AlreadySettled(group.id)),
        GroupState::Expired if group.is_expired(now) => Err(Error::GroupExpired(group.id)),
        GroupState::Expired => Err(Error::GroupClosed(group.id)),
    }
}

fn require_admin(actor: &Actor) -> Result<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

/// Why a participant may not leave a group.
enum ExitBlocker {
    LastParticipant,
    SoleAdmin,
    Balance(String),
}

pub struct GroupService {
    ctx: Arc<Context>,
    tokens: Arc<dyn TokenGenerator>,
}

impl GroupService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self::with_tokens(ctx, Arc::new(RandomTokens))
    }

    pub fn with_tokens(ctx: Arc<Context>, tokens: Arc<dyn TokenGenerator>) -> Self {
        Self { ctx, tokens }
    }

    pub fn group(&self, id: GroupId) -> Result<Group> {
        let tables = self.ctx.store.snapshot();
        tables.require_group(id).cloned().map_err(Error::lookup)
    }

    pub fn group_by_share_token(&self, token: &str) -> Result<Group> {
        let tables = self.ctx.store.snapshot();
        tables
            .group_by_share_token(token)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("group with share token {token}")))
    }

    /// Check a credential against `group`.
    pub fn resolve(&self, group: GroupId, credential: &Credential) -> Result<Actor> {
        let tables = self.ctx.store.snapshot();
        let g = tables.require_group(group).map_err(Error::lookup)?;
        match credential {
            Credential::AdminToken(token) if *token == g.admin_token => Ok(Actor::Admin),
            Credential::ParticipantToken(token) => tables
                .participant_by_token(token)
                .filter(|p| p.group_id == group)
                .map(|p| Actor::Real(p.id))
                .ok_or(Error::Forbidden),
            Credential::Viewer(email) => Ok(Actor::Viewer(email.clone())),
            Credential::AdminToken(_) => Err(Error::Forbidden),
        }
    }

    /// Create a group with its creator as the first, admin participant.
    ///
    /// A token collision is retried with fresh tokens up to
    /// [`CREATE_ATTEMPTS`] times.
    pub fn create_group(&self, request: NewGroup) -> Result<CreatedGroup> {
        let name = request.name.trim();
        let creator_name = request.creator_name.trim();
        if name.is_empty() || creator_name.is_empty() {
            return Err(Error::InvalidInput("group and creator name are required".into()));
        }
        let currency = CurrencyCode::supported(&request.currency)?;
        let now = self.ctx.now();
        let expires_at = request.expires_on.map(end_of_day);
        if expires_at.map_or(false, |at| at <= now) {
            return Err(Error::InvalidInput("expiration date must be in the future".into()));
        }
        let creator_email = request
            .creator_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);

        let mut attempt = 0;
        let (group, creator) = loop {
            attempt += 1;
            let group = Group {
                id: GroupId::new(0),
                name: name.to_string(),
                description: request.description.as_deref().map(str::trim).filter(|d| !d.is_empty()).map(str::to_string),
                currency: currency.clone(),
                share_token: self.tokens.share_token(),
                admin_token: self.tokens.admin_token(),
                is_active: true,
                is_settled: false,
                settled_at: None,
                expires_at,
                is_recurring: request.recurring,
                next_settlement_date: request.recurring.then(|| first_settlement_date(now)),
                created_at: now,
                updated_at: now,
            };
            match self.insert_new_group(group, creator_name, creator_email.clone(), now) {
                Ok(created) => break created,
                Err(e) if conflict(&e) && attempt < CREATE_ATTEMPTS => {
                    warn!("token collision creating group (attempt {}/{}): {}", attempt, CREATE_ATTEMPTS, e);
                }
                Err(e) => return Err(e),
            }
        };
        info!("created {} '{}' for {}", group.id, group.name, creator.name);

        let confirmation = creator_email.map(|email| {
            let message = report::group_created(
                &group.name,
                &self.ctx.links.group(&group.share_token),
                &self.ctx.links.admin(&group.share_token, &group.admin_token),
            );
            self.ctx.dispatcher.send(&NotificationRequest {
                kind: NotificationKind::GroupCreated,
                recipient: email,
                group_id: Some(group.id),
                participant_id: Some(creator.id),
                message,
            })
        });
        Ok(CreatedGroup {
            group,
            creator,
            confirmation,
        })
    }

    fn insert_new_group(
        &self,
        mut group: Group,
        creator_name: &str,
        creator_email: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Group, Participant)> {
        let mut tx = self.ctx.store.begin()?;
        let tables = tx.tables_mut();
        group.id = tables.next_group_id();
        tables.insert_group(group.clone())?;
        let creator = Participant {
            id: tables.next_participant_id(),
            group_id: group.id,
            name: creator_name.to_string(),
            email: creator_email,
            color: participant_color(0).to_string(),
            is_admin: true,
            access_token: self.tokens.access_token(),
            joined_at: now,
        };
        tables.insert_participant(creator.clone())?;
        tables.append_audit(
            group.id,
            NewAuditEntry::new(
                AuditAction::GroupCreated,
                format!("Group \"{}\" created by {}", group.name, creator.name),
                json!({
                    "currency": group.currency,
                    "is_recurring": group.is_recurring,
                    "expires_at": group.expires_at.map(|d| d.to_rfc3339()),
                }),
                creator.name.clone(),
            )
            .participant(creator.id),
            now,
        );
        tx.commit()?;
        Ok((group, creator))
    }

    /// Add a participant. Anyone holding the share link may join; when the
    /// admin adds someone with an address, that person is mailed their
    /// personal link.
    pub fn add_participant(
        &self,
        group_id: GroupId,
        actor: &Actor,
        name: &str,
        email: Option<&str>,
    ) -> Result<Participant> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("participant name is required".into()));
        }
        let email = email.map(str::trim).filter(|e| !e.is_empty()).map(str::to_string);
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        ensure_open(&group, now)?;

        let tables = tx.tables_mut();
        let existing = tables.participants_of(group_id);
        if existing.iter().any(|p| p.name.eq_ignore_ascii_case(name)) {
            return Err(Error::InvalidInput(format!("a participant named {name} already exists")));
        }
        let color = participant_color(existing.len()).to_string();
        let performed_by = self.actor_label(tables, actor);
        let participant = Participant {
            id: tables.next_participant_id(),
            group_id,
            name: name.to_string(),
            email,
            color,
            is_admin: false,
            access_token: self.tokens.access_token(),
            joined_at: now,
        };
        tables.insert_participant(participant.clone())?;
        let description = match (&participant.email, actor.is_admin()) {
            (Some(email), true) => format!("Admin added participant \"{}\" with email {}", participant.name, email),
            (None, true) => format!("Admin added participant \"{}\"", participant.name),
            _ => format!("New participant joined: {}", participant.name),
        };
        tables.append_audit(
            group_id,
            NewAuditEntry::new(
                AuditAction::ParticipantAdded,
                description,
                json!({ "participant_name": participant.name, "has_email": participant.has_email() }),
                performed_by,
            )
            .participant(participant.id),
            now,
        );
        tx.commit()?;
        info!("{} joined {}", participant.id, group_id);

        self.ctx.broadcaster.broadcast(
            &group.room(),
            BroadcastEvent::ParticipantUpdate,
            json!({ "action": "added", "participant": participant_payload(&participant) }),
        );
        if actor.is_admin() {
            if let Some(email) = &participant.email {
                let link = self.ctx.links.participant(&group.share_token, &participant.access_token);
                self.ctx.dispatcher.send(&NotificationRequest {
                    kind: NotificationKind::PrecreatedInvitation,
                    recipient: email.clone(),
                    group_id: Some(group_id),
                    participant_id: Some(participant.id),
                    message: report::precreated_invitation(&participant.name, &group.name, &link),
                });
            }
        }
        Ok(participant)
    }

    /// Email the group's join link to `email`.
    pub fn invite(&self, group_id: GroupId, actor: &Actor, email: &str) -> Result<DeliveryOutcome> {
        if matches!(actor, Actor::Viewer(_)) {
            return Err(Error::Forbidden);
        }
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        ensure_open(&group, now)?;
        let performed_by = self.actor_label(tx.tables(), actor);
        tx.tables_mut().append_audit(
            group_id,
            NewAuditEntry::new(
                AuditAction::ParticipantInvited,
                format!("Participant invited via email: {email}"),
                json!({ "email": email }),
                performed_by,
            ),
            now,
        );
        tx.commit()?;

        Ok(self.ctx.dispatcher.send(&NotificationRequest {
            kind: NotificationKind::Invitation,
            recipient: email.to_string(),
            group_id: Some(group_id),
            participant_id: None,
            message: report::invitation(&group.name, &self.ctx.links.group(&group.share_token)),
        }))
    }

    fn exit_blocker(&self, tables: &Tables, group: &Group, participant: &Participant) -> Result<Option<ExitBlocker>> {
        let members = tables.participants_of(group.id);
        if members.len() <= 1 {
            return Ok(Some(ExitBlocker::LastParticipant));
        }
        if participant.is_admin && !members.iter().any(|p| p.is_admin && p.id != participant.id) {
            return Ok(Some(ExitBlocker::SoleAdmin));
        }
        let ledger = BalanceEngine::compute(tables, group.id, &group.currency, &self.ctx.converter)?;
        let balance = ledger.position(participant.id);
        if balance.abs() > NOISE_FLOOR {
            return Ok(Some(ExitBlocker::Balance(format_amount(balance, &group.currency))));
        }
        Ok(None)
    }

    /// Whether `participant` may leave their group, with a reason when not.
    /// Settled groups can always be left.
    pub fn can_exit(&self, participant: ParticipantId) -> Result<(bool, String)> {
        let tables = self.ctx.store.snapshot();
        let p = tables
            .participant(participant)
            .ok_or_else(|| Error::not_found(participant.to_string()))?;
        let group = tables.require_group(p.group_id).map_err(Error::lookup)?;
        if group.is_settled {
            return Ok((true, "OK".to_string()));
        }
        let verdict = match self.exit_blocker(&tables, group, p)? {
            None => (true, "OK".to_string()),
            Some(ExitBlocker::LastParticipant) => (false, Error::LastParticipant.to_string()),
            Some(ExitBlocker::SoleAdmin) => (false, Error::SoleAdmin.to_string()),
            Some(ExitBlocker::Balance(amount)) => (
                false,
                format!("Cannot exit - you have an outstanding balance of {amount}. Please settle your balance first"),
            ),
        };
        Ok(verdict)
    }

    /// Remove a participant (admin only). Their paid expenses move to
    /// another admin, or else to the first other participant, and their
    /// shares are dropped.
    pub fn remove_participant(&self, group_id: GroupId, actor: &Actor, participant: ParticipantId) -> Result<()> {
        require_admin(actor)?;
        self.detach(group_id, actor, participant, AuditAction::ParticipantRemoved)
    }

    /// The calling participant leaves the group.
    pub fn leave(&self, group_id: GroupId, actor: &Actor) -> Result<()> {
        let participant = actor.participant_id().ok_or(Error::Forbidden)?;
        self.detach(group_id, actor, participant, AuditAction::ParticipantLeft)
    }

    fn detach(&self, group_id: GroupId, actor: &Actor, participant_id: ParticipantId, action: AuditAction) -> Result<()> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        let leaving_settled = action == AuditAction::ParticipantLeft && group.is_settled;
        if !leaving_settled {
            ensure_open(&group, now)?;
        }
        let participant = tx
            .tables()
            .participant(participant_id)
            .filter(|p| p.group_id == group_id)
            .cloned()
            .ok_or_else(|| Error::not_found(participant_id.to_string()))?;

        if !leaving_settled {
            match self.exit_blocker(tx.tables(), &group, &participant)? {
                None => {}
                Some(ExitBlocker::LastParticipant) => return Err(Error::LastParticipant),
                Some(ExitBlocker::SoleAdmin) => return Err(Error::SoleAdmin),
                Some(ExitBlocker::Balance(amount)) => {
                    return Err(Error::OutstandingBalance {
                        name: participant.name.clone(),
                        amount,
                    })
                }
            }
        }

        let performed_by = self.actor_label(tx.tables(), actor);
        let tables = tx.tables_mut();
        let paid = tables.expenses_paid_by(participant_id);
        if !paid.is_empty() {
            let others = tables.participants_of(group_id);
            let heir = others
                .iter()
                .find(|p| p.id != participant_id && p.is_admin)
                .or_else(|| others.iter().find(|p| p.id != participant_id))
                .map(|p| (p.id, p.name.clone()));
            if let Some((heir_id, heir_name)) = heir {
                for id in &paid {
                    if let Some(expense) = tables.expense_mut(*id) {
                        expense.paid_by = heir_id;
                    }
                }
                tables.append_audit(
                    group_id,
                    NewAuditEntry::new(
                        AuditAction::ExpensesTransferred,
                        format!("Transferred {} expenses from {} to {}", paid.len(), participant.name, heir_name),
                        json!({
                            "from_participant": participant.name,
                            "to_participant": heir_name,
                            "expense_count": paid.len(),
                            "expense_ids": paid,
                        }),
                        performed_by.clone(),
                    )
                    .participant(participant_id),
                    now,
                );
            }
        }
        let shares = tables.remove_shares_of_participant(participant_id);
        tables.remove_participant(participant_id);
        let description = match action {
            AuditAction::ParticipantLeft => format!("{} left the group", participant.name),
            _ => format!("Removed participant {}", participant.name),
        };
        tables.append_audit(
            group_id,
            NewAuditEntry::new(
                action,
                description,
                json!({
                    "participant_name": participant.name,
                    "had_expenses": !paid.is_empty(),
                    "had_shares": shares > 0,
                }),
                performed_by,
            ),
            now,
        );
        tx.commit()?;
        info!("{} removed from {}", participant_id, group_id);

        self.ctx.broadcaster.broadcast(
            &group.room(),
            BroadcastEvent::ParticipantUpdate,
            json!({ "action": "removed", "participant": participant_payload(&participant) }),
        );
        self.broadcast_balances(&group);
        Ok(())
    }

    fn actor_label(&self, tables: &Tables, actor: &Actor) -> String {
        let name = actor
            .participant_id()
            .and_then(|id| tables.participant(id))
            .map(|p| p.name.as_str());
        actor.label(name)
    }

    fn check_writer(tables: &Tables, group: GroupId, actor: &Actor) -> Result<()> {
        match actor {
            Actor::Admin => Ok(()),
            Actor::Real(id) if tables.participant(*id).map_or(false, |p| p.group_id == group) => Ok(()),
            _ => Err(Error::Forbidden),
        }
    }

    /// Resolve the rate before any transaction opens: a fetched rate is
    /// written to the store. A group's currency is fixed at creation.
    fn convert_input(&self, group_id: GroupId, input: &ExpenseInput) -> Result<Converted> {
        if input.amount <= Decimal::ZERO {
            return Err(Error::InvalidInput("amount must be positive".into()));
        }
        let base = self.group(group_id)?.currency;
        let currency = CurrencyCode::supported(&input.currency)?;
        let exchange_rate = self.ctx.converter.rate(&currency, &base)?;
        Ok(Converted {
            amount: round_money(input.amount * exchange_rate, &base),
            original_amount: input.amount,
            currency,
            exchange_rate,
        })
    }

    /// Validate the split and return the share holders.
    fn share_holders(tables: &Tables, group: GroupId, input: &ExpenseInput) -> Result<Vec<ParticipantId>> {
        if input.split_type != SplitType::Equal {
            return Err(Error::UnsupportedSplit(format!("{:?}", input.split_type).to_lowercase()));
        }
        if input.title.trim().is_empty() {
            return Err(Error::InvalidInput("expense title is required".into()));
        }
        let members: Vec<ParticipantId> = tables.participants_of(group).iter().map(|p| p.id).collect();
        if !members.contains(&input.paid_by) {
            return Err(Error::InvalidInput(format!("{} is not in this group", input.paid_by)));
        }
        if input.split_between.is_empty() {
            return Ok(members);
        }
        let mut holders = input.split_between.clone();
        holders.sort();
        holders.dedup();
        if let Some(stranger) = holders.iter().find(|id| !members.contains(id)) {
            return Err(Error::InvalidInput(format!("{stranger} is not in this group")));
        }
        Ok(holders)
    }

    fn write_shares(tables: &mut Tables, expense: ExpenseId, amount: Decimal, holders: &[ParticipantId]) -> Result<()> {
        let portion = round_half_up(amount / Decimal::from(holders.len()), 2);
        for holder in holders {
            let id = tables.next_share_id();
            tables.insert_share(ExpenseShare {
                id,
                expense_id: expense,
                participant_id: *holder,
                amount: portion,
            })?;
        }
        Ok(())
    }

    pub fn add_expense(&self, group_id: GroupId, actor: &Actor, input: ExpenseInput) -> Result<Expense> {
        let now = self.ctx.now();
        let converted = self.convert_input(group_id, &input)?;
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        Self::check_writer(tx.tables(), group_id, actor)?;
        ensure_open(&group, now)?;
        let holders = Self::share_holders(tx.tables(), group_id, &input)?;
        let performed_by = self.actor_label(tx.tables(), actor);

        let tables = tx.tables_mut();
        let expense = Expense {
            id: tables.next_expense_id(),
            group_id,
            title: input.title.trim().to_string(),
            amount: converted.amount,
            original_amount: converted.original_amount,
            currency: converted.currency,
            exchange_rate: converted.exchange_rate,
            paid_by: input.paid_by,
            date: input.date,
            split_type: input.split_type,
            is_archived: false,
            settlement_period: None,
            created_at: now,
        };
        tables.insert_expense(expense.clone())?;
        Self::write_shares(tables, expense.id, expense.amount, &holders)?;
        let entry = NewAuditEntry::new(
            AuditAction::ExpenseAdded,
            format!("Added expense \"{}\" ({})", expense.title, format_amount(expense.amount, &group.currency)),
            self.expense_details(tables, &expense, holders.len()),
            performed_by,
        )
        .expense(expense.id);
        let entry = match actor.participant_id() {
            Some(id) => entry.participant(id),
            None => entry,
        };
        tables.append_audit(group_id, entry, now);
        tx.commit()?;
        info!("{} added to {}: {}", expense.id, group_id, expense.amount);

        self.broadcast_expense(&group, "added", &expense);
        Ok(expense)
    }

    /// Replace an expense's fields and shares. Archived expenses are frozen.
    pub fn edit_expense(
        &self,
        group_id: GroupId,
        actor: &Actor,
        expense_id: ExpenseId,
        input: ExpenseInput,
    ) -> Result<Expense> {
        let now = self.ctx.now();
        let converted = self.convert_input(group_id, &input)?;
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        Self::check_writer(tx.tables(), group_id, actor)?;
        ensure_open(&group, now)?;
        let current = Self::current_expense(tx.tables(), group_id, expense_id)?;
        let holders = Self::share_holders(tx.tables(), group_id, &input)?;
        let performed_by = self.actor_label(tx.tables(), actor);

        let tables = tx.tables_mut();
        let expense = Expense {
            title: input.title.trim().to_string(),
            amount: converted.amount,
            original_amount: converted.original_amount,
            currency: converted.currency,
            exchange_rate: converted.exchange_rate,
            paid_by: input.paid_by,
            date: input.date,
            split_type: input.split_type,
            ..current.clone()
        };
        if let Some(row) = tables.expense_mut(expense_id) {
            *row = expense.clone();
        }
        tables.remove_shares_of_expense(expense_id);
        Self::write_shares(tables, expense_id, expense.amount, &holders)?;
        let mut details = self.expense_details(tables, &expense, holders.len());
        details["previous_amount"] = json!(current.amount);
        details["previous_title"] = json!(current.title);
        tables.append_audit(
            group_id,
            NewAuditEntry::new(
                AuditAction::ExpenseEdited,
                format!(
                    "Updated expense \"{}\" ({})",
                    expense.title,
                    format_amount(expense.original_amount, &expense.currency)
                ),
                details,
                performed_by,
            )
            .expense(expense_id),
            now,
        );
        tx.commit()?;

        self.broadcast_expense(&group, "updated", &expense);
        Ok(expense)
    }

    pub fn delete_expense(&self, group_id: GroupId, actor: &Actor, expense_id: ExpenseId) -> Result<()> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        Self::check_writer(tx.tables(), group_id, actor)?;
        ensure_open(&group, now)?;
        let expense = Self::current_expense(tx.tables(), group_id, expense_id)?;
        let performed_by = self.actor_label(tx.tables(), actor);

        let tables = tx.tables_mut();
        let details = self.expense_details(tables, &expense, tables.shares_of(expense_id).len());
        tables.remove_expense(expense_id);
        tables.append_audit(
            group_id,
            NewAuditEntry::new(
                AuditAction::ExpenseDeleted,
                format!(
                    "Deleted expense \"{}\" ({})",
                    expense.title,
                    format_amount(expense.original_amount, &expense.currency)
                ),
                details,
                performed_by,
            ),
            now,
        );
        tx.commit()?;

        self.broadcast_expense(&group, "deleted", &expense);
        Ok(())
    }

    fn current_expense(tables: &Tables, group: GroupId, id: ExpenseId) -> Result<Expense> {
        let expense = tables
            .expense(id)
            .filter(|e| e.group_id == group)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        if expense.is_archived {
            return Err(Error::InvalidInput(format!("{id} is archived and can no longer change")));
        }
        Ok(expense.clone())
    }

    fn expense_details(&self, tables: &Tables, expense: &Expense, split_count: usize) -> Value {
        let paid_by = tables
            .participant(expense.paid_by)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        json!({
            "expense_title": expense.title,
            "expense_amount": expense.amount,
            "expense_currency": expense.currency,
            "original_amount": expense.original_amount,
            "exchange_rate": expense.exchange_rate,
            "paid_by_name": paid_by,
            "split_count": split_count,
        })
    }

    fn broadcast_expense(&self, group: &Group, action: &str, expense: &Expense) {
        self.ctx.broadcaster.broadcast(
            &group.room(),
            BroadcastEvent::ExpenseUpdate,
            json!({ "action": action, "expense": expense }),
        );
        self.broadcast_balances(group);
    }

    fn broadcast_balances(&self, group: &Group) {
        match self.balances(group.id, None) {
            Ok(ledger) => {
                let balances: serde_json::Map<String, Value> = ledger
                    .positions()
                    .iter()
                    .map(|(id, amount)| {
                        (id.get().to_string(), json!({ "amount": amount, "currency": ledger.currency() }))
                    })
                    .collect();
                self.ctx.broadcaster.broadcast(
                    &group.room(),
                    BroadcastEvent::BalanceUpdate,
                    json!({ "balances": balances }),
                );
            }
            Err(e) => warn!("skipping balance broadcast for {}: {}", group.id, e),
        }
    }

    /// Current balances, in `display` or the group currency.
    pub fn balances(&self, group_id: GroupId, display: Option<&CurrencyCode>) -> Result<Ledger> {
        let tables = self.ctx.store.snapshot();
        let group = tables.require_group(group_id).map_err(Error::lookup)?;
        let display = display.unwrap_or(&group.currency);
        Ok(BalanceEngine::compute(&tables, group_id, display, &self.ctx.converter)?)
    }

    /// Transfers that would settle the current balances.
    pub fn settlement_plan(&self, group_id: GroupId) -> Result<SettlementPlan> {
        Ok(NettingEngine::settle(&self.balances(group_id, None)?))
    }

    /// Confirm a recorded settlement payment. The admin or the receiving
    /// participant may confirm.
    pub fn mark_payment_paid(&self, group_id: GroupId, payment_id: PaymentId, actor: &Actor) -> Result<Transition<()>> {
        self.set_payment(group_id, payment_id, actor, true)
    }

    /// Undo a confirmation (admin only).
    pub fn mark_payment_unpaid(&self, group_id: GroupId, payment_id: PaymentId, actor: &Actor) -> Result<Transition<()>> {
        require_admin(actor)?;
        self.set_payment(group_id, payment_id, actor, false)
    }

    fn set_payment(&self, group_id: GroupId, payment_id: PaymentId, actor: &Actor, paid: bool) -> Result<Transition<()>> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        let payment = tx
            .tables()
            .payment(payment_id)
            .filter(|p| p.group_id == group_id)
            .cloned()
            .ok_or_else(|| Error::not_found(payment_id.to_string()))?;
        if !actor.is_admin() && actor.participant_id() != Some(payment.to) {
            return Err(Error::Forbidden);
        }
        if payment.is_paid == paid {
            let state = if paid { "paid" } else { "unpaid" };
            return Ok(Transition::unchanged(format!("Payment is already marked as {state}")));
        }

        let performed_by = self.actor_label(tx.tables(), actor);
        let name = |id| {
            tx.tables()
                .participant(id)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| id.to_string())
        };
        let summary = format!(
            "{} from {} to {}",
            format_amount(payment.amount, &group.currency),
            name(payment.from),
            name(payment.to)
        );
        let tables = tx.tables_mut();
        let (action, description) = match tables.payment_mut(payment_id) {
            Some(row) if paid => {
                row.mark_paid(performed_by.clone(), now);
                (AuditAction::PaymentMarkedPaid, format!("Payment of {summary} marked as paid"))
            }
            Some(row) => {
                row.mark_unpaid();
                (AuditAction::PaymentMarkedUnpaid, format!("Payment of {summary} marked as unpaid"))
            }
            None => return Err(Error::not_found(payment_id.to_string())),
        };
        tables.append_audit(
            group_id,
            NewAuditEntry::new(action, description, json!({ "payment_id": payment_id, "amount": payment.amount }), performed_by),
            now,
        );
        tx.commit()?;
        Ok(Transition::Applied(()))
    }

    /// Plain-text export of the group's history.
    pub fn history_text(&self, group_id: GroupId) -> Result<String> {
        let tables = self.ctx.store.snapshot();
        let group = tables.require_group(group_id).map_err(Error::lookup)?;
        let ledger = BalanceEngine::compute(&tables, group_id, &group.currency, &self.ctx.converter)?;
        let plan = NettingEngine::settle(&ledger);
        Ok(history::history_text(
            &tables,
            group,
            &ledger,
            &plan,
            self.ctx.now(),
            self.ctx.activity_log_limit,
        ))
    }
}

fn participant_payload(p: &Participant) -> Value {
    json!({ "id": p.id, "name": p.name, "color": p.color, "is_admin": p.is_admin })
}
