use super::ui;
use crate::core::budget::{Budget, BudgetOptions};
use crate::core::model::{Amount, Collective, CollectiveId};
use anyhow::Result;
use comfy_table::Cell;
use std::collections::BTreeMap;

/// Figures shown for a single collective.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectiveReport {
    pub collective: Collective,
    pub balance: Amount,
    pub blocked_balance: Option<Amount>,
    pub total_received: Amount,
    pub net_received: Amount,
}

impl CollectiveReport {
    pub async fn build(
        budget: &dyn Budget,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> Result<Self> {
        let mut plain = options.clone();
        plain.with_blocked_funds = false;
        let balance = budget.balance(collective, &plain).await?;
        let blocked_balance = if options.with_blocked_funds {
            Some(budget.balance_with_blocked_funds(collective, &plain).await?)
        } else {
            None
        };
        Ok(CollectiveReport {
            collective: collective.clone(),
            balance,
            blocked_balance,
            total_received: budget.total_amount_received(collective, options).await?,
            net_received: budget.total_net_amount_received(collective, options).await?,
        })
    }

    pub fn display_as_table(&self) -> String {
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Metric"),
            ui::header_cell(&format!("Value ({})", self.balance.currency)),
        ]);

        let mut rows = vec![("Balance", self.balance.value)];
        if let Some(blocked) = &self.blocked_balance {
            rows.push(("Balance with blocked funds", blocked.value));
        }
        rows.push(("Total received", self.total_received.value));
        rows.push(("Net received", self.net_received.value));
        for (label, value) in rows {
            table.add_row(vec![Cell::new(label), ui::amount_cell(value)]);
        }

        format!(
            "Collective: {} {}\n\n{}",
            ui::style_text(&self.collective.name, ui::StyleType::Title),
            ui::style_text(
                &format!("({}, {})", self.collective.slug, self.collective.scheme_version()),
                ui::StyleType::Subtle
            ),
            table
        )
    }
}

pub fn display_balances(balances: &BTreeMap<CollectiveId, Amount>) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Collective"),
        ui::header_cell("Balance"),
        ui::header_cell("Currency"),
    ]);
    for (id, amount) in balances {
        table.add_row(vec![
            Cell::new(id),
            ui::amount_cell(amount.value),
            Cell::new(&amount.currency),
        ]);
    }

    let mut output = table.to_string();
    if let Some(currency) = balances.values().next().map(|a| a.currency.clone()) {
        let total = Amount::new(balances.values().map(|a| a.value).sum(), &currency);
        output.push_str(&format!("\n\n{}", ui::total_line("Total", &total)));
    }
    output
}
