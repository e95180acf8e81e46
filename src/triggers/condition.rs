// =============================================================================
// Condition Evaluator — pure comparison of market data against thresholds
// =============================================================================
//
// A condition names a field (a ticker field, or an indicator computed over a
// candle window of one granularity), an operator and a threshold. Evaluation
// never fails: missing data yields `actual_value: None` and `triggered:
// false`. Crossing operators compare the current value with the value one
// update earlier; without a previous value nothing has crossed yet.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::indicators::Indicator;
use crate::market_data::{Candle, Ticker};
use crate::types::Granularity;

/// Relative tolerance for `eq`.
const EQ_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TickerField {
    Price,
    Volume24h,
    PercentChange24h,
    High24h,
    Low24h,
    High52w,
    Low52w,
    BestBid,
    BestAsk,
    BestBidQuantity,
    BestAskQuantity,
}

impl TickerField {
    /// `None` when the exchange left the field blank.
    pub fn read(self, ticker: &Ticker) -> Option<f64> {
        match self {
            Self::Price => Some(ticker.price),
            Self::Volume24h => ticker.volume_24h,
            Self::PercentChange24h => ticker.percent_change_24h,
            Self::High24h => ticker.high_24h,
            Self::Low24h => ticker.low_24h,
            Self::High52w => ticker.high_52w,
            Self::Low52w => ticker.low_52w,
            Self::BestBid => ticker.best_bid,
            Self::BestAsk => ticker.best_ask,
            Self::BestBidQuantity => ticker.best_bid_quantity,
            Self::BestAskQuantity => ticker.best_ask_quantity,
        }
    }
}

/// Either a ticker field or an indicator, by its camelCase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionField {
    Ticker(TickerField),
    Indicator(Indicator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    #[serde(alias = "=", alias = "==")]
    Eq,
    #[serde(alias = "crosses-above")]
    CrossAbove,
    #[serde(alias = "crosses-below")]
    CrossBelow,
}

impl Operator {
    pub fn is_crossing(self) -> bool {
        matches!(self, Self::CrossAbove | Self::CrossBelow)
    }

    /// Apply the operator. `current == None` never triggers; crossings also
    /// need `previous`.
    pub fn apply(self, current: Option<f64>, previous: Option<f64>, threshold: f64) -> bool {
        let Some(value) = current else {
            return false;
        };
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => {
                let scale = value.abs().max(threshold.abs()).max(1.0);
                (value - threshold).abs() <= EQ_EPSILON * scale
            }
            Self::CrossAbove => previous.is_some_and(|prev| prev <= threshold && value > threshold),
            Self::CrossBelow => previous.is_some_and(|prev| prev >= threshold && value < threshold),
        }
    }
}

/// One trigger condition from a wait request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: ConditionField,
    pub operator: Operator,
    #[serde(alias = "value")]
    pub threshold: f64,
    /// Candle width an indicator is computed on. Required for indicators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    /// Indicator period override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<usize>,
}

impl Condition {
    pub fn indicator(&self) -> Option<Indicator> {
        match self.field {
            ConditionField::Indicator(indicator) => Some(indicator),
            ConditionField::Ticker(_) => None,
        }
    }

    pub fn uses_ticker(&self) -> bool {
        matches!(self.field, ConditionField::Ticker(_))
    }

    /// Candles an indicator condition needs; zero for ticker fields.
    pub fn lookback(&self) -> usize {
        self.indicator().map_or(0, |i| i.lookback(self.period))
    }

    fn value(
        &self,
        ticker: Option<&Ticker>,
        candles: &HashMap<Granularity, Vec<Candle>>,
    ) -> Option<f64> {
        match self.field {
            ConditionField::Ticker(field) => ticker.and_then(|t| field.read(t)),
            ConditionField::Indicator(indicator) => {
                let window = candles.get(&self.granularity?)?;
                indicator.compute(window, self.period)
            }
        }
    }
}

/// Outcome of one condition at one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionResult {
    pub field: ConditionField,
    pub operator: Operator,
    pub threshold: f64,
    pub actual_value: Option<f64>,
    pub triggered: bool,
}

impl ConditionResult {
    /// Result for a condition that has not been evaluated yet.
    pub fn pending(condition: &Condition) -> Self {
        Self {
            field: condition.field,
            operator: condition.operator,
            threshold: condition.threshold,
            actual_value: None,
            triggered: false,
        }
    }
}

/// Evaluate every condition against the current (and previous) ticker and
/// per-granularity candle windows. One result per condition, in order.
pub fn evaluate_conditions(
    conditions: &[Condition],
    current_ticker: Option<&Ticker>,
    previous_ticker: Option<&Ticker>,
    current_candles: &HashMap<Granularity, Vec<Candle>>,
    previous_candles: &HashMap<Granularity, Vec<Candle>>,
) -> Vec<ConditionResult> {
    conditions
        .iter()
        .map(|condition| {
            let actual_value = condition.value(current_ticker, current_candles);
            let previous_value = if condition.operator.is_crossing() {
                condition.value(previous_ticker, previous_candles)
            } else {
                None
            };
            ConditionResult {
                field: condition.field,
                operator: condition.operator,
                threshold: condition.threshold,
                actual_value,
                triggered: condition
                    .operator
                    .apply(actual_value, previous_value, condition.threshold),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{series, ticker};
    use serde_json::json;

    fn price(operator: Operator, threshold: f64) -> Condition {
        Condition {
            field: ConditionField::Ticker(TickerField::Price),
            operator,
            threshold,
            granularity: None,
            period: None,
        }
    }

    fn no_candles() -> HashMap<Granularity, Vec<Candle>> {
        HashMap::new()
    }

    #[test]
    fn parses_request_shapes() {
        let c: Condition = serde_json::from_value(json!({
            "field": "rsi", "operator": "<", "value": 30, "granularity": "ONE_HOUR", "period": 7
        }))
        .unwrap();
        assert_eq!(c.field, ConditionField::Indicator(Indicator::Rsi));
        assert_eq!(c.operator, Operator::Lt);
        assert_eq!(c.threshold, 30.0);
        assert_eq!(c.granularity, Some(Granularity::OneHour));
        assert_eq!(c.period, Some(7));

        let c: Condition = serde_json::from_value(json!({
            "field": "percentChange24h", "operator": "crosses-above", "threshold": 5.0
        }))
        .unwrap();
        assert_eq!(c.field, ConditionField::Ticker(TickerField::PercentChange24h));
        assert_eq!(c.operator, Operator::CrossAbove);

        assert!(serde_json::from_value::<Condition>(json!({
            "field": "marketCap", "operator": "gt", "threshold": 1
        }))
        .is_err());
    }

    #[test]
    fn comparison_operators() {
        assert!(Operator::Gt.apply(Some(2.0), None, 1.0));
        assert!(!Operator::Gt.apply(Some(1.0), None, 1.0));
        assert!(Operator::Gte.apply(Some(1.0), None, 1.0));
        assert!(Operator::Lt.apply(Some(0.5), None, 1.0));
        assert!(Operator::Lte.apply(Some(1.0), None, 1.0));
        assert!(Operator::Eq.apply(Some(50_000.0 + 1e-6), None, 50_000.0));
        assert!(!Operator::Eq.apply(Some(50_000.1), None, 50_000.0));
        assert!(!Operator::Gt.apply(None, Some(5.0), 1.0));
        assert!(!Operator::Lt.apply(Some(f64::NAN), None, 1.0));
    }

    #[test]
    fn crossing_needs_a_previous_value() {
        assert!(!Operator::CrossAbove.apply(Some(101.0), None, 100.0));
        assert!(Operator::CrossAbove.apply(Some(101.0), Some(100.0), 100.0));
        assert!(!Operator::CrossAbove.apply(Some(102.0), Some(101.0), 100.0));
        assert!(Operator::CrossBelow.apply(Some(99.0), Some(100.5), 100.0));
        assert!(!Operator::CrossBelow.apply(Some(99.0), Some(98.0), 100.0));
    }

    #[test]
    fn ticker_conditions_read_the_current_ticker() {
        let current = ticker("BTC-USD", 51_000.0);
        let results = evaluate_conditions(
            &[price(Operator::Gt, 50_000.0), price(Operator::Lt, 3_000.0)],
            Some(&current),
            None,
            &no_candles(),
            &no_candles(),
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].triggered);
        assert_eq!(results[0].actual_value, Some(51_000.0));
        assert!(!results[1].triggered);
    }

    #[test]
    fn missing_ticker_never_triggers() {
        let results = evaluate_conditions(
            &[price(Operator::Lt, 1e12)],
            None,
            None,
            &no_candles(),
            &no_candles(),
        );
        assert_eq!(results[0].actual_value, None);
        assert!(!results[0].triggered);
    }

    #[test]
    fn blank_ticker_fields_never_trigger() {
        let mut current = ticker("BTC-USD", 50_000.0);
        current.best_bid = None;
        let bid_below = Condition {
            field: ConditionField::Ticker(TickerField::BestBid),
            operator: Operator::Lt,
            threshold: 49_000.0,
            granularity: None,
            period: None,
        };
        let bid_at_most = Condition { operator: Operator::Lte, ..bid_below.clone() };
        let results = evaluate_conditions(
            &[bid_below, bid_at_most],
            Some(&current),
            None,
            &no_candles(),
            &no_candles(),
        );
        for result in &results {
            assert_eq!(result.actual_value, None);
            assert!(!result.triggered);
        }
    }

    #[test]
    fn price_cross_uses_previous_ticker() {
        let prev = ticker("ETH-USD", 2_990.0);
        let cur = ticker("ETH-USD", 3_010.0);
        let cond = [price(Operator::CrossAbove, 3_000.0)];
        let first = evaluate_conditions(&cond, Some(&cur), None, &no_candles(), &no_candles());
        assert!(!first[0].triggered);
        let second = evaluate_conditions(&cond, Some(&cur), Some(&prev), &no_candles(), &no_candles());
        assert!(second[0].triggered);
    }

    #[test]
    fn indicator_conditions_use_their_granularity_window() {
        let cond = Condition {
            field: ConditionField::Indicator(Indicator::Sma),
            operator: Operator::CrossAbove,
            threshold: 10.0,
            granularity: Some(Granularity::OneHour),
            period: Some(3),
        };
        let mut previous = HashMap::new();
        previous.insert(Granularity::OneHour, series("X", Granularity::OneHour, &[9.0, 10.0, 11.0]));
        let mut current = HashMap::new();
        current.insert(
            Granularity::OneHour,
            series("X", Granularity::OneHour, &[10.0, 11.0, 12.0]),
        );

        let results = evaluate_conditions(&[cond.clone()], None, None, &current, &previous);
        assert_eq!(results[0].actual_value, Some(11.0));
        assert!(results[0].triggered);

        // Wrong granularity in the map: no value.
        let mut other = HashMap::new();
        other.insert(Granularity::OneDay, series("X", Granularity::OneDay, &[1.0, 2.0, 3.0]));
        let results = evaluate_conditions(&[cond], None, None, &other, &previous);
        assert_eq!(results[0].actual_value, None);
        assert!(!results[0].triggered);
    }

    #[test]
    fn result_serializes_camel_case_with_null_actual() {
        let result = ConditionResult::pending(&price(Operator::Gte, 1.0));
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"field":"price","operator":"gte","threshold":1.0,"actualValue":null,"triggered":false})
        );
    }
}
