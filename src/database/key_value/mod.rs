mod rooms;
mod transaction_ids;
