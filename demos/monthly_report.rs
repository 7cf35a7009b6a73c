use chrono::{NaiveDate, TimeZone, Utc};
use mess_ledger::*;

fn member(id: &str, name: &str) -> Member {
    Member {
        id: id.to_string(),
        name: Some(name.to_string()),
        email: None,
        phone: None,
        auth_user_id: Some(format!("auth-{}", id)),
    }
}

fn seed() -> MessSnapshot {
    let members = vec![member("m1", "Arif"), member("m2", "Bina"), member("m3", "Chandra")];
    let mut meals = Vec::new();
    let mut id = 0;

    for day in 1..=14 {
        let date = NaiveDate::from_ymd_opt(2025, 8, day).unwrap();
        for (i, m) in members.iter().enumerate() {
            // Chandra only logs every third day; the chart carries it forward.
            if i == 2 && day % 3 != 1 {
                continue;
            }
            id += 1;
            meals.push(MealRecord {
                id,
                member_id: m.id.clone(),
                date,
                meal_count: if i == 1 { 1.5 } else { 2.0 },
                created_at: Utc
                    .with_ymd_and_hms(2025, 8, day, 10 + day % 3, 30, 0)
                    .single(),
            });
        }
    }

    let bazar = vec![
        BazarRecord {
            id: 101,
            member_id: "m1".to_string(),
            item_name: "Rice (25kg)".to_string(),
            cost: 1850.0,
            date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            paid_from: PaidFrom::Box,
        },
        BazarRecord {
            id: 102,
            member_id: "m2".to_string(),
            item_name: "Fish and vegetables".to_string(),
            cost: 1320.0,
            date: NaiveDate::from_ymd_opt(2025, 8, 7).unwrap(),
            paid_from: PaidFrom::Box,
        },
    ];

    let deposits = members
        .iter()
        .enumerate()
        .map(|(i, m)| DepositRecord {
            id: 201 + i as i64,
            member_id: m.id.clone(),
            amount: 1500.0,
            date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
        })
        .collect();

    MessSnapshot {
        members,
        meals,
        bazar,
        deposits,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("🍛 Mess Ledger Monthly Report Demo\n");

    let config = MessConfig::default();
    let store = InMemoryStore::from_snapshot(seed());

    let session = open_session(
        &store,
        Identity {
            user_id: "auth-m3".to_string(),
            email: Some("chandra@mess.test".to_string()),
            display_name: None,
        },
    )
    .await?;

    let outcome = record_bazar(
        &store,
        &store,
        &session,
        BazarDraft {
            item_name: "Cooking gas".to_string(),
            cost: 1450.0,
            date: NaiveDate::from_ymd_opt(2025, 8, 10).unwrap(),
            paid_from: PaidFrom::User,
        },
    )
    .await?;
    println!(
        "{} recorded a user-paid bazar of {} (matching deposit #{})\n",
        session.display_name(),
        format_amount(outcome.record.cost, &config.currency_label),
        outcome.deposit.map(|d| d.id).unwrap_or_default()
    );

    let report = load_period_report(&store, Period::parse("2025-08")?).await?;
    println!("📅 Period: {}", report.period);
    println!(
        "   Meals: {}  Bazar: {}  Deposits: {}",
        format_count(report.totals.meals),
        format_amount(report.totals.bazar_cost, &config.currency_label),
        format_amount(report.totals.deposits, &config.currency_label)
    );
    println!(
        "   Meal rate: {}\n",
        format_amount(report.meal_rate, &config.currency_label)
    );

    println!("{:<10} {:>6} {:>12} {:>12} {:>12}", "Member", "Meals", "Deposits", "Share", "Net");
    for row in &report.ledger.rows {
        println!(
            "{:<10} {:>6} {:>12.2} {:>12.2} {:>+12.2}",
            row.name,
            format_count(row.meals),
            row.deposits,
            row.fair_share,
            row.net_balance
        );
    }
    report
        .ledger
        .verify_fair_share(&report.period.label(), report.totals.bazar_cost, config.fairness_tolerance)?;
    println!("✓ Fair shares add up to the bazar total\n");

    println!("🧾 Bazar");
    for line in &report.bazar {
        println!(
            "   {}  {:<22} {:<8} {}",
            format_date_with_day(line.date),
            line.item_name,
            line.member_name,
            format_amount(line.cost, &config.currency_label)
        );
    }

    let dinner = NaiveDate::from_ymd_opt(2025, 8, 12).unwrap();
    let chart = load_meal_chart(&store, dinner, &config).await?;
    println!(
        "\n🍽️  Meal chart: dinner {} / lunch {}",
        chart.query.dinner_date,
        chart.query.lunch_date
    );
    for row in &chart.rows {
        let carried = if row.dinner.is_carried_forward(dinner) {
            row.dinner
                .source_date
                .map(|d| format!(" (from {})", d))
                .unwrap_or_default()
        } else {
            String::new()
        };
        println!(
            "   {:<10} dinner {}{}  lunch {}",
            row.name,
            format_count(row.dinner.value),
            carried,
            format_count(row.lunch.value)
        );
    }
    let totals = chart.totals();
    println!(
        "   Totals: dinner {}  lunch {}  all {}",
        format_count(totals.dinner),
        format_count(totals.lunch),
        format_count(totals.all)
    );

    Ok(())
}
