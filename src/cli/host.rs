use super::ui;
use crate::core::ledger::CollectiveBalance;
use crate::core::model::{Amount, Collective};
use comfy_table::Cell;

pub fn display_money_managed(host: &Collective, managed: &Amount) -> String {
    format!(
        "Host: {}\n\n{}",
        ui::style_text(&host.name, ui::StyleType::Title),
        ui::total_line("Money managed", managed)
    )
}

pub fn display_host_snapshot(host: &Collective, balances: &[CollectiveBalance]) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Collective"),
        ui::header_cell(&format!("Balance ({})", host.currency)),
    ]);
    for row in balances {
        table.add_row(vec![
            Cell::new(row.collective_id),
            ui::amount_cell(row.balance),
        ]);
    }
    let total = Amount::new(balances.iter().map(|b| b.balance).sum(), &host.currency);
    format!(
        "Host: {}\n\n{}\n\n{}",
        ui::style_text(&host.name, ui::StyleType::Title),
        table,
        ui::total_line("Total", &total)
    )
}

pub fn display_yearly_income(collective: &Collective, income: i64) -> String {
    format!(
        "Collective: {}\n\n{}",
        ui::style_text(&collective.name, ui::StyleType::Title),
        ui::total_line("Projected yearly income", &Amount::new(income, &collective.currency))
    )
}
