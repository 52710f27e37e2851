use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::WalletError;

/// Monetary amount. Always exact; never constructed from a float.
pub type Amount = Decimal;

/// Display currency for all wallets.
pub const CURRENCY: &str = "KES";

/// Number of fractional digits a stored amount may carry.
pub const MONEY_SCALE: u32 = 2;

/// Largest single amount a request may carry: 9,999,999,999.99 (twelve digits, two of them
/// fractional).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xD4A5_0FFF, 0xE8, 0, false, MONEY_SCALE);

/// Returns `amount` if it is strictly positive, at most [`MAX_AMOUNT`], and fits the money scale.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, WalletError> {
    if amount <= Decimal::ZERO || amount > MAX_AMOUNT || amount.normalize().scale() > MONEY_SCALE
    {
        return Err(WalletError::InvalidAmount { amount });
    }
    Ok(amount)
}

/// `lhs + rhs`, or `InvalidAmount { amount: rhs }` if the sum does not fit a `Decimal`.
pub fn checked_add(lhs: Decimal, rhs: Decimal) -> Result<Decimal, WalletError> {
    lhs.checked_add(rhs)
        .ok_or(WalletError::InvalidAmount { amount: rhs })
}

/// `lhs - rhs`, or `InvalidAmount { amount: rhs }` on overflow.
pub fn checked_sub(lhs: Decimal, rhs: Decimal) -> Result<Decimal, WalletError> {
    lhs.checked_sub(rhs)
        .ok_or(WalletError::InvalidAmount { amount: rhs })
}

/// `amount * factor`, or `InvalidAmount { amount }` on overflow.
pub fn checked_mul(amount: Decimal, factor: Decimal) -> Result<Decimal, WalletError> {
    amount
        .checked_mul(factor)
        .ok_or(WalletError::InvalidAmount { amount })
}

/// Truncate toward zero to the money scale.
///
/// Used for payouts (`unit_cost * multiplier`) whose product may carry more digits than a
/// stored amount.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero)
}

/// Render an amount for log lines and operator output, e.g. `KES 120.00`.
pub fn format_amount(amount: Decimal) -> String {
    format!("{CURRENCY} {:.2}", amount)
}
