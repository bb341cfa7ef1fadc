mod timeout;

pub(crate) use timeout::timeout;
